// Static operation table and typed operation arguments.

use crate::access::Role;
use crate::error::RequestFailure;
use crate::model::SplitAt;

use super::params::Params;

/// When an operation may run relative to login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// Only before login.
    Guest,
    /// Before and after login.
    Any,
    /// Only after login.
    Member,
}

impl AuthPhase {
    pub const fn allows(self, authenticated: bool) -> bool {
        match self {
            Self::Guest => !authenticated,
            Self::Any => true,
            Self::Member => authenticated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Register,
    Login,
    ChangePass,
    ChangeEmail,
    ResetPass,
    Logout,
    CreateRepo,
    GetRole,
    AddPermission,
    RemovePermission,
    Listen,
    Unlisten,
    ListFiles,
    GetFile,
    GetLine,
    CreateFile,
    MoveFile,
    DeleteFile,
    Insert,
    Erase,
    Split,
    Merge,
}

#[derive(Debug, Clone, Copy)]
pub struct OperationSpec {
    pub id: &'static str,
    pub kind: OperationKind,
    pub phase: AuthPhase,
    /// Minimum role on the named repository, for repository-scoped operations.
    pub role: Option<Role>,
}

const fn spec(id: &'static str, kind: OperationKind, phase: AuthPhase, role: Option<Role>) -> OperationSpec {
    OperationSpec { id, kind, phase, role }
}

pub const OPERATIONS: &[OperationSpec] = &[
    spec("register", OperationKind::Register, AuthPhase::Guest, None),
    spec("login", OperationKind::Login, AuthPhase::Guest, None),
    spec("changePass", OperationKind::ChangePass, AuthPhase::Any, None),
    spec("changeEmail", OperationKind::ChangeEmail, AuthPhase::Any, None),
    spec("resetPass", OperationKind::ResetPass, AuthPhase::Any, None),
    spec("logout", OperationKind::Logout, AuthPhase::Member, None),
    spec("createRepo", OperationKind::CreateRepo, AuthPhase::Member, None),
    spec("getRole", OperationKind::GetRole, AuthPhase::Member, Some(Role::None)),
    spec("addPermission", OperationKind::AddPermission, AuthPhase::Member, Some(Role::Manager)),
    spec("removePermission", OperationKind::RemovePermission, AuthPhase::Member, Some(Role::Manager)),
    spec("listen", OperationKind::Listen, AuthPhase::Member, Some(Role::Observer)),
    spec("unlisten", OperationKind::Unlisten, AuthPhase::Member, Some(Role::None)),
    spec("listFiles", OperationKind::ListFiles, AuthPhase::Member, Some(Role::Observer)),
    spec("getFile", OperationKind::GetFile, AuthPhase::Member, Some(Role::Observer)),
    spec("getLine", OperationKind::GetLine, AuthPhase::Member, Some(Role::Observer)),
    spec("createFile", OperationKind::CreateFile, AuthPhase::Member, Some(Role::Contributor)),
    spec("moveFile", OperationKind::MoveFile, AuthPhase::Member, Some(Role::Contributor)),
    spec("deleteFile", OperationKind::DeleteFile, AuthPhase::Member, Some(Role::Contributor)),
    spec("insert", OperationKind::Insert, AuthPhase::Member, Some(Role::Contributor)),
    spec("erase", OperationKind::Erase, AuthPhase::Member, Some(Role::Contributor)),
    spec("split", OperationKind::Split, AuthPhase::Member, Some(Role::Contributor)),
    spec("merge", OperationKind::Merge, AuthPhase::Member, Some(Role::Contributor)),
];

pub fn lookup(id: &str) -> Option<&'static OperationSpec> {
    OPERATIONS.iter().find(|spec| spec.id == id)
}

/// A validated operation with its typed arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Register { name: String, pass: String, email: Option<String> },
    Login { name: String, pass: String },
    ChangePass { name: String, pass: String, new_pass: String },
    ChangeEmail { name: String, pass: String, new_email: String },
    ResetPass { name: String },
    Logout,
    CreateRepo { repo: String },
    GetRole { repo: String },
    AddPermission { repo: String, user: String, role: String },
    RemovePermission { repo: String, user: String },
    Listen { repo: String, path: Option<String> },
    Unlisten { repo: String },
    ListFiles { repo: String, pattern: Option<String> },
    GetFile { repo: String, path: String },
    GetLine { repo: String, path: String, line_id: String },
    CreateFile { repo: String, path: String, line_id: Option<String> },
    MoveFile { repo: String, path: String, new_path: String },
    DeleteFile { repo: String, path: String },
    Insert { repo: String, path: String, line_id: String, column: usize, data: String },
    Erase { repo: String, path: String, line_id: String, column: usize, count: usize },
    Split { repo: String, path: String, line_id: String, at: SplitAt, new_line_id: String },
    Merge { repo: String, path: String, line_id: String },
}

impl Operation {
    /// Extract arguments in declaration order, failing on the first bad one.
    pub fn parse(kind: OperationKind, params: Params<'_>) -> Result<Self, RequestFailure> {
        let op = match kind {
            OperationKind::Register => Self::Register {
                name: params.string("name")?,
                pass: params.string("pass")?,
                email: params.optional_string("email")?,
            },
            OperationKind::Login => {
                Self::Login { name: params.string("name")?, pass: params.string("pass")? }
            }
            OperationKind::ChangePass => Self::ChangePass {
                name: params.string("name")?,
                pass: params.string("pass")?,
                new_pass: params.string("newPass")?,
            },
            OperationKind::ChangeEmail => Self::ChangeEmail {
                name: params.string("name")?,
                pass: params.string("pass")?,
                new_email: params.string("newEmail")?,
            },
            OperationKind::ResetPass => Self::ResetPass { name: params.string("name")? },
            OperationKind::Logout => Self::Logout,
            OperationKind::CreateRepo => Self::CreateRepo { repo: params.string("repo")? },
            OperationKind::GetRole => Self::GetRole { repo: params.string("repo")? },
            OperationKind::AddPermission => Self::AddPermission {
                repo: params.string("repo")?,
                user: params.string("user")?,
                role: params.string("role")?,
            },
            OperationKind::RemovePermission => Self::RemovePermission {
                repo: params.string("repo")?,
                user: params.string("user")?,
            },
            OperationKind::Listen => Self::Listen {
                repo: params.string("repo")?,
                path: params.optional_string("path")?,
            },
            OperationKind::Unlisten => Self::Unlisten { repo: params.string("repo")? },
            OperationKind::ListFiles => Self::ListFiles {
                repo: params.string("repo")?,
                pattern: params.optional_string("pattern")?,
            },
            OperationKind::GetFile => {
                Self::GetFile { repo: params.string("repo")?, path: params.string("path")? }
            }
            OperationKind::GetLine => Self::GetLine {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.string("lineId")?,
            },
            OperationKind::CreateFile => Self::CreateFile {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.optional_string("lineId")?,
            },
            OperationKind::MoveFile => Self::MoveFile {
                repo: params.string("repo")?,
                path: params.string("path")?,
                new_path: params.string("newPath")?,
            },
            OperationKind::DeleteFile => {
                Self::DeleteFile { repo: params.string("repo")?, path: params.string("path")? }
            }
            OperationKind::Insert => Self::Insert {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.string("lineId")?,
                column: params.unsigned("column")?,
                data: params.string("data")?,
            },
            OperationKind::Erase => Self::Erase {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.string("lineId")?,
                column: params.unsigned("column")?,
                count: params.unsigned("count")?,
            },
            OperationKind::Split => Self::Split {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.string("lineId")?,
                at: params.split_column("column")?,
                new_line_id: params.string("newLineId")?,
            },
            OperationKind::Merge => Self::Merge {
                repo: params.string("repo")?,
                path: params.string("path")?,
                line_id: params.string("lineId")?,
            },
        };
        Ok(op)
    }

    /// The repository this operation is scoped to, if any.
    pub fn repo(&self) -> Option<&str> {
        match self {
            Self::Register { .. }
            | Self::Login { .. }
            | Self::ChangePass { .. }
            | Self::ChangeEmail { .. }
            | Self::ResetPass { .. }
            | Self::Logout
            | Self::CreateRepo { .. } => None,
            Self::GetRole { repo }
            | Self::AddPermission { repo, .. }
            | Self::RemovePermission { repo, .. }
            | Self::Listen { repo, .. }
            | Self::Unlisten { repo }
            | Self::ListFiles { repo, .. }
            | Self::GetFile { repo, .. }
            | Self::GetLine { repo, .. }
            | Self::CreateFile { repo, .. }
            | Self::MoveFile { repo, .. }
            | Self::DeleteFile { repo, .. }
            | Self::Insert { repo, .. }
            | Self::Erase { repo, .. }
            | Self::Split { repo, .. }
            | Self::Merge { repo, .. } => Some(repo.as_str()),
        }
    }
}
