use crate::command::{BodyMode, CommandCx, CommandFailure, CommandHandler};
use crate::entity::Entity;
use crate::response::{CommandError, STATUS_OK, close_response, open_response};
use crate::xml::text_element;
use async_trait::async_trait;
use tracing::{info, warn};

/// `authenticate`：`<credentials><username/><password/></credentials>`。
///
/// 成功后会话身份被替换；失败不改变已有身份。
pub struct Authenticate;

#[async_trait]
impl CommandHandler for Authenticate {
    fn body_mode(&self) -> BodyMode {
        BodyMode::Nested
    }

    fn requires_auth(&self) -> bool {
        false
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        let username = command
            .descendant(&["credentials", "username"])
            .map(Entity::trimmed_text)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| CommandError::syntax("AUTHENTICATE requires a username"))?;
        let password = command
            .descendant(&["credentials", "password"])
            .map(|node| node.text.as_str())
            .unwrap_or_default();

        let Some(credentials) = cx.services.authenticator.authenticate(username, password)? else {
            warn!(username, "authentication failed");
            return Err(CommandError::auth_failed().into());
        };
        info!(username, role = credentials.role.as_str(), "client authenticated");

        let body = format!(
            "{}{}{}{}",
            open_response(&command.name, STATUS_OK, "OK"),
            text_element("role", credentials.role.as_str()),
            text_element("timezone", &credentials.timezone),
            close_response(&command.name)
        );
        cx.session.credentials = Some(credentials);
        cx.emit(&body).await?;
        Ok(())
    }
}
