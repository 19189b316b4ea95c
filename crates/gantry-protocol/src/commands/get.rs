use crate::command::{CommandCx, CommandFailure, CommandHandler, Services, SessionState};
use crate::entity::Entity;
use crate::list::{check_attributes, list_resources};
use crate::resources::ResourceKind;
use crate::response::CommandError;
use crate::xml::Attributes;
use async_trait::async_trait;

/// `get_<plural>`：列表子协议的命令外壳。
pub struct GetResources {
    kind: &'static ResourceKind,
}

impl GetResources {
    pub fn new(kind: &'static ResourceKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl CommandHandler for GetResources {
    fn on_attributes(
        &self,
        attributes: &Attributes,
        _session: &SessionState,
        _services: &Services,
    ) -> Result<(), CommandError> {
        check_attributes(self.kind, attributes)
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        list_resources(self.kind, &command.name, &command.attributes, cx).await?;
        Ok(())
    }
}
