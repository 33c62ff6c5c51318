use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::sql::Command;

/// User name that logs in with the kiosk password.
pub const KIOSK_USER: &str = "kiosk";

/// What a connection may do, decided by the user name it logged in with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Front-desk staff: every command.
    Staff,
    /// Customer-facing kiosk: the non-sensitive customer lookup only.
    Kiosk,
}

impl Role {
    pub fn for_user(user: Option<&str>) -> Self {
        match user {
            Some(u) if u.eq_ignore_ascii_case(KIOSK_USER) => Role::Kiosk,
            _ => Role::Staff,
        }
    }

    pub fn permits(&self, cmd: &Command) -> bool {
        match self {
            Role::Staff => true,
            Role::Kiosk => matches!(cmd, Command::SelectCustomer { .. }),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Role::Staff => "staff",
            Role::Kiosk => "kiosk",
        }
    }
}

/// Cleartext password source with one password per role.
#[derive(Debug, Clone)]
pub struct SlotLedgerAuthSource {
    staff_password: String,
    kiosk_password: Option<String>,
}

impl SlotLedgerAuthSource {
    pub fn new(staff_password: String, kiosk_password: Option<String>) -> Self {
        Self { staff_password, kiosk_password }
    }
}

#[async_trait]
impl AuthSource for SlotLedgerAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let password = match Role::for_user(login.user()) {
            Role::Staff => &self.staff_password,
            Role::Kiosk => match &self.kiosk_password {
                Some(p) => p,
                None => {
                    metrics::counter!(crate::observability::AUTH_FAILURES_TOTAL).increment(1);
                    return Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                        "FATAL".into(),
                        "28000".into(),
                        "kiosk logins are disabled".into(),
                    ))));
                }
            },
        };
        Ok(Password::new(None, password.as_bytes().to_vec()))
    }
}
