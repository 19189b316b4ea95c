use crate::command::{CommandCx, CommandFailure, CommandHandler};
use crate::entity::Entity;
use crate::response::{STATUS_OK, close_response, open_response};
use crate::xml::text_element;
use async_trait::async_trait;

/// `get_version`：未认证也可调用。
pub struct GetVersion;

#[async_trait]
impl CommandHandler for GetVersion {
    fn requires_auth(&self) -> bool {
        false
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        let body = format!(
            "{}{}{}",
            open_response(&command.name, STATUS_OK, "OK"),
            text_element("version", &cx.services.settings.version),
            close_response(&command.name)
        );
        cx.emit(&body).await?;
        Ok(())
    }
}

/// `help`：列出已注册的命令。
pub struct Help;

#[async_trait]
impl CommandHandler for Help {
    fn requires_auth(&self) -> bool {
        false
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        let mut body = open_response(&command.name, STATUS_OK, "OK");
        for name in cx.registry.names() {
            body.push_str(&format!("<command name=\"{name}\"/>"));
        }
        body.push_str(&close_response(&command.name));
        cx.emit(&body).await?;
        Ok(())
    }
}
