use crate::command::{BodyMode, CommandCx, CommandFailure, CommandHandler, Services, SessionState};
use crate::entity::Entity;
use crate::list::validated_id;
use crate::resources::ResourceKind;
use crate::response::{CommandError, STATUS_OK, empty_response};
use crate::xml::Attributes;
use async_trait::async_trait;
use tracing::info;

/// `modify_<type>`：每个子元素给出一列的新值。
///
/// 所有子元素先校验，再逐列写入；任何一个未知列都会让整条命令失败且不写入。
pub struct ModifyResource {
    kind: &'static ResourceKind,
}

impl ModifyResource {
    pub fn new(kind: &'static ResourceKind) -> Self {
        Self { kind }
    }

    fn required_id<'a>(&self, attributes: &'a Attributes) -> Result<&'a str, CommandError> {
        let name = self.kind.id_attribute();
        validated_id(attributes, &name)?.ok_or_else(|| {
            CommandError::syntax(format!(
                "MODIFY_{} requires a {name} attribute",
                self.kind.name.to_uppercase()
            ))
        })
    }
}

#[async_trait]
impl CommandHandler for ModifyResource {
    fn body_mode(&self) -> BodyMode {
        BodyMode::Nested
    }

    fn on_attributes(
        &self,
        attributes: &Attributes,
        _session: &SessionState,
        _services: &Services,
    ) -> Result<(), CommandError> {
        self.required_id(attributes).map(|_| ())
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        let id = self.required_id(&command.attributes)?;
        let mut changes = Vec::with_capacity(command.children.len());
        for child in &command.children {
            if !self.kind.writable.contains(&child.name.as_str()) {
                return Err(
                    CommandError::syntax(format!("Unknown element '{}'", child.name)).into(),
                );
            }
            changes.push((child.name.as_str(), child.trimmed_text()));
        }

        let services = cx.services;
        let who = cx.session.who()?;
        if !services
            .authorizer
            .authorize_resource(who, &command.name, self.kind.name, id)?
        {
            return Err(CommandError::permission_denied().into());
        }
        if services.store.find(self.kind.name, id)?.is_none() {
            return Err(CommandError::not_found(self.kind.name, id).into());
        }
        for (field, value) in &changes {
            services.store.set_field(self.kind.name, id, field, value)?;
        }
        info!(
            resource = self.kind.name,
            id,
            columns = changes.len(),
            user = %who.username,
            "resource modified"
        );

        cx.emit(&empty_response(&command.name, STATUS_OK, "OK")).await?;
        Ok(())
    }
}
