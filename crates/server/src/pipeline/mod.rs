// Request pipeline: one serialized queue per connection.
//
// Each envelope is looked up in the operation table, gated on login state,
// validated, checked against the caller's role on the named repository and
// finally dispatched into the session. Every request resolves exactly once,
// including when it times out or panics.

mod operation;
mod params;
mod request;

use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};

use bittle_common::protocol::{Envelope, Response};
use futures_util::FutureExt;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::access::Role;
use crate::error::RequestFailure;
use crate::model::{FileSnapshot, LineSnapshot};
use crate::session::Session;

pub use operation::{lookup, AuthPhase, Operation, OperationKind, OperationSpec, OPERATIONS};
pub use params::Params;
pub use request::{Payload, Reply, Request};

/// Lines per `getFile` frame.
pub const GET_FILE_CHUNK_LINES: usize = 512;

pub struct Pipeline {
    session: Session,
    timeout: Duration,
}

impl Pipeline {
    pub fn new(session: Session, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Run one request to completion and return every frame it produced.
    pub async fn process(&mut self, envelope: Envelope) -> Vec<Response> {
        let mut request = Request::new(envelope);
        request.open();
        let started = Instant::now();
        debug!(op = %request.id(), "request opened");

        let timeout = self.timeout;
        let run = AssertUnwindSafe(self.run(request.envelope())).catch_unwind();
        let result = tokio::time::timeout(timeout, run).await;
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_panic)) => {
                warn!(op = %request.id(), "request handler panicked");
                Err(RequestFailure::Panicked)
            }
            Err(_elapsed) => {
                warn!(op = %request.id(), timeout_ms = timeout.as_millis() as u64, "request timed out");
                Err(RequestFailure::TimedOut)
            }
        };

        let frames = match outcome {
            Ok(reply) => request.complete(reply),
            Err(failure) => vec![request.fail(&failure)],
        };

        info!(
            op = %request.id(),
            status = request.status().as_str(),
            latency_ms = started.elapsed().as_millis() as u64,
            user = %self.session.name(),
            "request resolved"
        );
        frames
    }

    async fn run(&mut self, envelope: &Envelope) -> Result<Reply, RequestFailure> {
        let authenticated = self.session.is_authenticated();
        let unknown = || {
            if authenticated {
                RequestFailure::BadId
            } else {
                RequestFailure::NotAllowedBeforeLogin
            }
        };

        let spec = lookup(&envelope.id).ok_or_else(unknown)?;
        if !spec.phase.allows(authenticated) {
            return Err(unknown());
        }

        let operation = Operation::parse(spec.kind, Params::new(envelope))?;

        let role = match (operation.repo(), spec.role) {
            (Some(repo), Some(required)) => {
                let role = self.session.resolve_role(repo).await?;
                if !role.allows(required) {
                    return Err(RequestFailure::InsufficientPermission);
                }
                role
            }
            _ => Role::None,
        };

        self.execute(operation, role).await
    }

    async fn execute(&mut self, operation: Operation, role: Role) -> Result<Reply, RequestFailure> {
        let session = &mut self.session;
        let reply = match operation {
            Operation::Register { name, pass, email } => {
                session.register(&name, &pass, email.as_deref()).await?;
                Reply::empty()
            }
            Operation::Login { name, pass } => {
                let name = session.login(&name, &pass).await?;
                done(json!({ "name": name }))
            }
            Operation::ChangePass { name, pass, new_pass } => {
                session.change_pass(&name, &pass, &new_pass).await?;
                Reply::empty()
            }
            Operation::ChangeEmail { name, pass, new_email } => {
                session.change_email(&name, &pass, &new_email).await?;
                Reply::empty()
            }
            Operation::ResetPass { name } => {
                session.reset_pass(&name).await?;
                Reply::empty()
            }
            Operation::Logout => {
                session.logout().await;
                Reply::empty()
            }
            Operation::CreateRepo { repo } => {
                session.create_repo(&repo).await?;
                Reply::empty()
            }
            Operation::GetRole { .. } => done(json!({ "role": role })),
            Operation::AddPermission { repo, user, role: new_role } => {
                session.add_permission(&repo, &user, &new_role).await?;
                Reply::empty()
            }
            Operation::RemovePermission { repo, user } => {
                session.remove_permission(&repo, &user).await?;
                Reply::empty()
            }
            Operation::Listen { repo, path } => {
                let pattern = session.listen(&repo, path.as_deref()).await?;
                done(json!({ "pattern": pattern }))
            }
            Operation::Unlisten { repo } => {
                session.unlisten(&repo).await?;
                Reply::empty()
            }
            Operation::ListFiles { repo, pattern } => {
                let files = session.list_files(&repo, pattern.as_deref()).await?;
                done(json!({ "files": files }))
            }
            Operation::GetFile { repo, path } => file_parts(session.get_file(&repo, &path).await?),
            Operation::GetLine { repo, path, line_id } => {
                let line = session.get_line(&repo, &path, &line_id).await?;
                done(serde_json::to_value(line).map_err(|error| {
                    warn!(error = %error, "line snapshot did not serialize");
                    RequestFailure::Internal
                })?)
            }
            Operation::CreateFile { repo, path, line_id } => {
                session.create_file(&repo, &path, line_id.as_deref()).await?;
                Reply::empty()
            }
            Operation::MoveFile { repo, path, new_path } => {
                session.move_file(&repo, &path, &new_path).await?;
                Reply::empty()
            }
            Operation::DeleteFile { repo, path } => {
                session.delete_file(&repo, &path).await?;
                Reply::empty()
            }
            Operation::Insert { repo, path, line_id, column, data } => {
                session.insert(&repo, &path, &line_id, column, &data).await?;
                Reply::empty()
            }
            Operation::Erase { repo, path, line_id, column, count } => {
                session.erase(&repo, &path, &line_id, column, count).await?;
                Reply::empty()
            }
            Operation::Split { repo, path, line_id, at, new_line_id } => {
                session.split(&repo, &path, &line_id, at, &new_line_id).await?;
                Reply::empty()
            }
            Operation::Merge { repo, path, line_id } => {
                session.merge(&repo, &path, &line_id).await?;
                Reply::empty()
            }
        };
        Ok(reply)
    }
}

fn done(value: Value) -> Reply {
    match value {
        Value::Object(payload) => Reply::Done(payload),
        _ => Reply::empty(),
    }
}

/// Stream a file as chunks of lines in chain order. Every part repeats the
/// file metadata so a client can start rendering from the first frame.
fn file_parts(snapshot: FileSnapshot) -> Reply {
    let FileSnapshot { path, version, updated, lines } = snapshot;
    let part = |lines: &[LineSnapshot]| -> Payload {
        let mut payload = Payload::new();
        payload.insert("path".into(), json!(path));
        payload.insert("version".into(), json!(version));
        payload.insert("updated".into(), json!(updated));
        payload.insert("lines".into(), json!(lines));
        payload
    };

    if lines.is_empty() {
        return Reply::Done(part(&[]));
    }
    Reply::Parts(lines.chunks(GET_FILE_CHUNK_LINES).map(part).collect())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bittle_common::protocol::{envelope_from_value, RequestStatus, Response};
    use serde_json::{json, Value};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    use super::{Pipeline, GET_FILE_CHUNK_LINES};
    use crate::auth::{Accounts, DisabledMailer, MailError, Mailer};
    use crate::repo::RepoRegistry;
    use crate::session::{ClientRegistry, Session};
    use crate::store::Store;

    fn pipeline(repos: &RepoRegistry, accounts: &Accounts) -> Pipeline {
        let (outbox, _rx) = mpsc::unbounded_channel();
        let session =
            Session::new(Uuid::new_v4(), "10.0.0.1:4000", outbox, accounts.clone(), repos.clone());
        Pipeline::new(session, Duration::from_secs(5))
    }

    fn services() -> (RepoRegistry, Accounts) {
        let store = Store::memory();
        let repos = RepoRegistry::new(store.clone(), ClientRegistry::default(), "0");
        (repos, Accounts::new(store, Arc::new(DisabledMailer)))
    }

    async fn call(pipeline: &mut Pipeline, body: Value) -> Vec<Response> {
        let envelope = envelope_from_value(body).expect("valid envelope");
        pipeline.process(envelope).await
    }

    async fn single(pipeline: &mut Pipeline, body: Value) -> Response {
        let mut frames = call(pipeline, body).await;
        assert_eq!(frames.len(), 1, "expected one frame: {frames:?}");
        frames.remove(0)
    }

    async fn logged_in(repos: &RepoRegistry, accounts: &Accounts, name: &str) -> Pipeline {
        let mut pipeline = pipeline(repos, accounts);
        let register = single(&mut pipeline, json!({"id": "register", "name": name, "pass": "pw"})).await;
        assert_eq!(register.status, RequestStatus::Closed, "{register:?}");
        let login = single(&mut pipeline, json!({"id": "login", "name": name, "pass": "pw"})).await;
        assert_eq!(login.status, RequestStatus::Closed, "{login:?}");
        pipeline
    }

    #[tokio::test]
    async fn guests_only_reach_pre_login_operations() {
        let (repos, accounts) = services();
        let mut pipeline = pipeline(&repos, &accounts);

        let frame = single(&mut pipeline, json!({"id": "getFile", "repo": "r1", "path": "a"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
        assert_eq!(
            frame.reason.as_deref(),
            Some("Request ID is not valid or is not allowed before logging in.")
        );

        let frame = single(&mut pipeline, json!({"id": "nonsense"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
    }

    #[tokio::test]
    async fn members_get_bad_id_for_unknown_and_guest_operations() {
        let (repos, accounts) = services();
        let mut pipeline = logged_in(&repos, &accounts, "alice").await;

        let frame = single(&mut pipeline, json!({"id": "nonsense"})).await;
        assert_eq!((frame.id.as_str(), frame.status), ("onReject", RequestStatus::Closed));
        assert_eq!(frame.reason.as_deref(), Some("Bad ID."));

        let frame = single(&mut pipeline, json!({"id": "login", "name": "alice", "pass": "pw"})).await;
        assert_eq!(frame.reason.as_deref(), Some("Bad ID."));
    }

    #[tokio::test]
    async fn login_returns_display_name() {
        let (repos, accounts) = services();
        let mut pipeline = pipeline(&repos, &accounts);
        single(&mut pipeline, json!({"id": "register", "name": "Alice", "pass": "pw"})).await;

        let frame = single(&mut pipeline, json!({"id": "login", "name": "ALICE", "pass": "pw"})).await;
        assert_eq!(frame.status, RequestStatus::Closed);
        assert_eq!(frame.payload["name"], "Alice");
        assert_eq!(pipeline.session().name(), "Alice");
    }

    #[tokio::test]
    async fn parameters_are_validated_before_roles() {
        let (repos, accounts) = services();
        let mut pipeline = logged_in(&repos, &accounts, "alice").await;

        let frame = single(&mut pipeline, json!({"id": "insert", "repo": "r1"})).await;
        assert_eq!(frame.reason.as_deref(), Some("Missing parameter path."));
        assert_eq!(frame.data, Some(json!({"id": "insert", "repo": "r1"})));

        let frame = single(
            &mut pipeline,
            json!({"id": "insert", "repo": "r1", "path": "a", "lineId": "0", "column": -2, "data": "x"}),
        )
        .await;
        assert_eq!(
            frame.reason.as_deref(),
            Some("Mistyped parameter column. Should be type unsigned integer.")
        );

        let frame = single(&mut pipeline, json!({"id": "getRole", "repo": "missing"})).await;
        assert_eq!(frame.reason.as_deref(), Some("Repo does not exist."));
    }

    #[tokio::test]
    async fn roles_gate_repository_operations() {
        let (repos, accounts) = services();
        let mut alice = logged_in(&repos, &accounts, "alice").await;
        let mut bob = logged_in(&repos, &accounts, "bob").await;

        single(&mut alice, json!({"id": "createRepo", "repo": "r1"})).await;
        let frame = single(&mut bob, json!({"id": "createFile", "repo": "r1", "path": "a.txt"})).await;
        assert_eq!(frame.reason.as_deref(), Some("Not enough permission."));

        let frame = single(&mut bob, json!({"id": "getRole", "repo": "r1"})).await;
        assert_eq!(frame.payload["role"], "none");

        let frame = single(
            &mut alice,
            json!({"id": "addPermission", "repo": "r1", "user": "bob", "role": "contributor"}),
        )
        .await;
        assert_eq!(frame.status, RequestStatus::Closed, "{frame:?}");

        let frame = single(&mut bob, json!({"id": "createFile", "repo": "r1", "path": "a.txt"})).await;
        assert_eq!(frame.status, RequestStatus::Closed, "{frame:?}");

        let frame = single(&mut bob, json!({"id": "removePermission", "repo": "r1", "user": "alice"})).await;
        assert_eq!(frame.reason.as_deref(), Some("Not enough permission."));
    }

    #[tokio::test]
    async fn edits_round_trip_through_get_line() {
        let (repos, accounts) = services();
        let mut alice = logged_in(&repos, &accounts, "alice").await;
        single(&mut alice, json!({"id": "createRepo", "repo": "r1"})).await;
        single(&mut alice, json!({"id": "createFile", "repo": "r1", "path": "a.txt"})).await;

        let insert = json!({"id": "insert", "repo": "r1", "path": "a.txt", "lineId": "0", "column": 0, "data": "Hello World"});
        assert_eq!(single(&mut alice, insert).await.status, RequestStatus::Closed);
        let split = json!({"id": "split", "repo": "r1", "path": "a.txt", "lineId": "0", "column": 5, "newLineId": "1"});
        assert_eq!(single(&mut alice, split).await.status, RequestStatus::Closed);

        let frame = single(&mut alice, json!({"id": "getLine", "repo": "r1", "path": "a.txt", "lineId": "1"})).await;
        assert_eq!(frame.payload["line"], " World");
        assert_eq!(frame.payload["previous"], "0");
        assert_eq!(frame.payload["version"], 1);

        let frame = single(&mut alice, json!({"id": "listFiles", "repo": "r1"})).await;
        assert_eq!(frame.payload["files"], json!(["a.txt"]));
    }

    #[tokio::test]
    async fn large_files_stream_in_parts() {
        let (repos, accounts) = services();
        let mut alice = logged_in(&repos, &accounts, "alice").await;
        single(&mut alice, json!({"id": "createRepo", "repo": "r1"})).await;
        single(&mut alice, json!({"id": "createFile", "repo": "r1", "path": "big.txt"})).await;

        for index in 1..=GET_FILE_CHUNK_LINES {
            let previous = (index - 1).to_string();
            let split = json!({
                "id": "split", "repo": "r1", "path": "big.txt",
                "lineId": previous, "column": -1, "newLineId": index.to_string()
            });
            assert_eq!(single(&mut alice, split).await.status, RequestStatus::Closed);
        }

        let frames = call(&mut alice, json!({"id": "getFile", "repo": "r1", "path": "big.txt"})).await;
        assert_eq!(frames.len(), 2);
        assert_eq!((frames[0].status, frames[0].part), (RequestStatus::Open, None));
        assert_eq!((frames[1].status, frames[1].part), (RequestStatus::Closed, Some(2)));

        let total: usize = frames
            .iter()
            .map(|frame| frame.payload["lines"].as_array().map_or(0, Vec::len))
            .sum();
        assert_eq!(total, GET_FILE_CHUNK_LINES + 1);
        assert_eq!(frames[0].payload["lines"][0]["lineId"], "0");
    }

    #[tokio::test]
    async fn logout_returns_to_guest_state() {
        let (repos, accounts) = services();
        let mut alice = logged_in(&repos, &accounts, "alice").await;

        let frame = single(&mut alice, json!({"id": "logout"})).await;
        assert_eq!(frame.status, RequestStatus::Closed);
        assert!(!alice.session().is_authenticated());

        let frame = single(&mut alice, json!({"id": "createRepo", "repo": "r1"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
    }

    struct CrashingMailer;

    impl Mailer for CrashingMailer {
        fn send_password_reset(&self, _email: &str, _name: &str, _pass: &str) -> Result<(), MailError> {
            panic!("mail transport crashed");
        }
    }

    #[tokio::test]
    async fn guest_reset_without_mail_transport_keeps_password() {
        let (repos, accounts) = services();
        let mut guest = pipeline(&repos, &accounts);
        let register = json!({"id": "register", "name": "alice", "pass": "pw", "email": "a@example.com"});
        assert_eq!(single(&mut guest, register).await.status, RequestStatus::Closed);

        let frame = single(&mut guest, json!({"id": "resetPass", "name": "alice"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
        assert_eq!(frame.reason.as_deref(), Some("Uncaught server error."));

        let frame = single(&mut guest, json!({"id": "login", "name": "alice", "pass": "pw"})).await;
        assert_eq!(frame.status, RequestStatus::Closed, "{frame:?}");
    }

    #[tokio::test]
    async fn slow_requests_time_out_and_the_queue_moves_on() {
        let store = Store::memory();
        let repos = RepoRegistry::new(store.clone(), ClientRegistry::default(), "0");
        let accounts = Accounts::new(store.clone(), Arc::new(DisabledMailer));
        let mut alice = logged_in(&repos, &accounts, "alice").await;
        single(&mut alice, json!({"id": "createRepo", "repo": "r1"})).await;
        alice.timeout = Duration::from_millis(50);

        let hold = store.hold_all().await.expect("memory store");
        let frame = single(&mut alice, json!({"id": "listFiles", "repo": "r1"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
        assert_eq!(frame.reason.as_deref(), Some("Request timed out."));
        assert_eq!(frame.data, Some(json!({"id": "listFiles", "repo": "r1"})));
        drop(hold);

        let frame = single(&mut alice, json!({"id": "listFiles", "repo": "r1"})).await;
        assert_eq!(frame.status, RequestStatus::Closed, "{frame:?}");
        assert_eq!(frame.payload["files"], json!([]));
    }

    #[tokio::test]
    async fn panicking_handlers_fail_only_their_request() {
        let store = Store::memory();
        let repos = RepoRegistry::new(store.clone(), ClientRegistry::default(), "0");
        let accounts = Accounts::new(store, Arc::new(CrashingMailer));
        let mut guest = pipeline(&repos, &accounts);
        let register = json!({"id": "register", "name": "alice", "pass": "pw", "email": "a@example.com"});
        assert_eq!(single(&mut guest, register).await.status, RequestStatus::Closed);

        let frame = single(&mut guest, json!({"id": "resetPass", "name": "alice"})).await;
        assert_eq!(frame.status, RequestStatus::Failed);
        assert_eq!(frame.reason.as_deref(), Some("Server syntax error."));

        let frame = single(&mut guest, json!({"id": "login", "name": "alice", "pass": "pw"})).await;
        assert_eq!(frame.status, RequestStatus::Closed, "{frame:?}");
    }
}
