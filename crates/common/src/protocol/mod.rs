// Wire protocol for bittle WebSocket connections.
//
// Inbound: one JSON object per text frame, `{"id": "<operation>", ...args}`.
// Outbound: `Response` frames for requests, `Reject` frames for unparseable
// input and `Notification` frames for live repository activity.

pub mod envelope;
pub mod response;

pub use envelope::{envelope_from_value, parse_envelope, Envelope, ProtocolReject, Rejected};
pub use response::{Notification, Outbound, Reject, RequestStatus, Response, REJECT_ID};
