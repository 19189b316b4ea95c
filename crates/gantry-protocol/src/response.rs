//! 命令级错误与响应元素的拼装。
//!
//! 命令错误只终止当前命令：引擎把它渲染成一个格式良好的
//! `<name_response status=".." status_text=".."/>`，然后回到空闲状态。

use crate::store::StoreError;
use crate::xml::escape;
use thiserror::Error;
use tracing::error;

pub const STATUS_OK: u16 = 200;
pub const STATUS_OK_REQUESTED: u16 = 202;

/// 未知命令与帧错误以 `<protocol_response>` 作答。
pub const PROTOCOL_COMMAND: &str = "protocol";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{status} {text}")]
pub struct CommandError {
    pub status: u16,
    pub text: String,
}

impl CommandError {
    pub fn new(status: u16, text: impl Into<String>) -> Self {
        Self {
            status,
            text: text.into(),
        }
    }

    /// 缺少或非法的属性、元素。
    pub fn syntax(text: impl Into<String>) -> Self {
        Self::new(400, text)
    }

    pub fn auth_required() -> Self {
        Self::new(401, "Authenticate first")
    }

    pub fn auth_failed() -> Self {
        Self::new(400, "Authentication failed")
    }

    pub fn permission_denied() -> Self {
        Self::new(403, "Permission denied")
    }

    pub fn not_found(resource_type: &str, id: &str) -> Self {
        Self::new(404, format!("Failed to find {resource_type} '{id}'"))
    }

    pub fn internal() -> Self {
        Self::new(500, "Internal error")
    }

    pub fn bogus() -> Self {
        Self::syntax("Bogus command name")
    }

    /// `<command_response status=".." status_text=".."/>`。
    pub fn render(&self, command: &str) -> String {
        format!(
            "<{command}_response status=\"{}\" status_text=\"{}\"/>",
            self.status,
            escape(&self.text)
        )
    }
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { resource_type, id } => Self::not_found(&resource_type, &id),
            StoreError::PermissionDenied => Self::permission_denied(),
            StoreError::Conflict(text) => Self::syntax(text),
            StoreError::Internal(source) => {
                error!(error = %source, "storage collaborator failed");
                Self::internal()
            }
        }
    }
}

/// 带子元素的成功响应的开始标签。
pub fn open_response(command: &str, status: u16, text: &str) -> String {
    format!(
        "<{command}_response status=\"{status}\" status_text=\"{}\">",
        escape(text)
    )
}

pub fn close_response(command: &str) -> String {
    format!("</{command}_response>")
}

/// 无子元素的成功响应。
pub fn empty_response(command: &str, status: u16, text: &str) -> String {
    format!(
        "<{command}_response status=\"{status}\" status_text=\"{}\"/>",
        escape(text)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_render_as_empty_response_elements() {
        assert_eq!(
            CommandError::not_found("alert", "a<b").render("get_alerts"),
            r#"<get_alerts_response status="404" status_text="Failed to find alert &apos;a&lt;b&apos;"/>"#
        );
        assert_eq!(
            CommandError::bogus().render(PROTOCOL_COMMAND),
            r#"<protocol_response status="400" status_text="Bogus command name"/>"#
        );
    }

    #[test]
    fn store_errors_map_to_status_codes() {
        assert_eq!(
            CommandError::from(StoreError::PermissionDenied).status,
            403
        );
        assert_eq!(
            CommandError::from(StoreError::internal("disk on fire")).status,
            500
        );
        assert_eq!(
            CommandError::from(StoreError::Conflict("Task is active already".into())),
            CommandError::syntax("Task is active already")
        );
        assert_eq!(
            CommandError::from(StoreError::not_found("task", "t1")).text,
            "Failed to find task 't1'"
        );
    }
}
