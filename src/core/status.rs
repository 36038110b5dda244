use serde::{Deserialize, Serialize};

/// Outcome of one stage; `code` becomes the process exit status.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Status {
    pub ok: bool,
    pub code: Option<i32>,
    pub reason: Option<String>,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            ok: true,
            code: Some(0),
            reason: None,
        }
    }

    pub fn err(code: i32, reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: Some(code),
            reason: Some(reason.into()),
        }
    }

    pub fn exit_code(&self) -> i32 {
        match (self.ok, self.code) {
            (true, _) => 0,
            (false, Some(code)) if code != 0 => code,
            (false, _) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code() {
        assert_eq!(Status::ok().exit_code(), 0);
        assert_eq!(Status::err(2, "bad verb").exit_code(), 2);
        assert_eq!(Status::err(0, "odd").exit_code(), 1);
    }
}
