use bittle_common::protocol::{Envelope, RequestStatus, Response, REJECT_ID};
use chrono::Utc;
use serde_json::{Map, Value};

use crate::error::RequestFailure;

pub type Payload = Map<String, Value>;

/// What a successful operation sends back.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// One terminal frame.
    Done(Payload),
    /// Several frames; all but the last are sent with status `open`.
    Parts(Vec<Payload>),
}

impl Reply {
    pub fn empty() -> Self {
        Self::Done(Payload::new())
    }
}

/// One inbound operation moving through `queued -> open -> closed | failed`.
#[derive(Debug)]
pub struct Request {
    envelope: Envelope,
    status: RequestStatus,
    part: u32,
}

impl Request {
    pub fn new(envelope: Envelope) -> Self {
        Self { envelope, status: RequestStatus::Queued, part: 0 }
    }

    pub fn id(&self) -> &str {
        &self.envelope.id
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn open(&mut self) {
        self.status = RequestStatus::Open;
    }

    /// Frames for a successful outcome; the last one closes the request.
    pub fn complete(&mut self, reply: Reply) -> Vec<Response> {
        let mut parts = match reply {
            Reply::Done(payload) => vec![payload],
            Reply::Parts(parts) => parts,
        };
        let last = parts.pop().unwrap_or_default();

        let mut frames: Vec<Response> = parts
            .into_iter()
            .map(|payload| self.frame(RequestStatus::Open, None, None, payload))
            .collect();
        frames.push(self.frame(RequestStatus::Closed, None, None, last));
        frames
    }

    /// The terminal frame for a failure, echoing the original payload.
    pub fn fail(&mut self, failure: &RequestFailure) -> Response {
        let data = self.envelope.to_value();
        let mut response =
            self.frame(failure.status(), Some(failure.reason()), Some(data), Payload::new());
        if *failure == RequestFailure::BadId {
            response.id = REJECT_ID.to_owned();
        }
        response
    }

    fn frame(
        &mut self,
        status: RequestStatus,
        reason: Option<String>,
        data: Option<Value>,
        payload: Payload,
    ) -> Response {
        self.status = status;
        self.part += 1;
        Response {
            id: self.envelope.id.clone(),
            status,
            part: (self.part > 1).then_some(self.part),
            time: Utc::now().timestamp_millis(),
            reason,
            data,
            payload,
        }
    }
}
