use crate::command::{CommandCx, CommandFailure, CommandHandler, Services, SessionState};
use crate::entity::Entity;
use crate::list::validated_id;
use crate::response::{CommandError, STATUS_OK_REQUESTED, close_response, open_response};
use crate::xml::{Attributes, text_element};
use async_trait::async_trait;
use gantry_scan::{QueueError, ScanEntry};
use tracing::{error, info};

/// `start_task`：创建报告并把它放进扫描队列，由调度器择机启动工作进程。
///
/// 活动状态检查由存储在创建报告的同一次加锁内完成；入队失败时撤回报告，
/// 任务回到请求前的状态，可以再次启动。
pub struct StartTask;

fn task_id(attributes: &Attributes) -> Result<&str, CommandError> {
    validated_id(attributes, "task_id")?
        .ok_or_else(|| CommandError::syntax("START_TASK requires a task_id attribute"))
}

#[async_trait]
impl CommandHandler for StartTask {
    fn on_attributes(
        &self,
        attributes: &Attributes,
        _session: &SessionState,
        _services: &Services,
    ) -> Result<(), CommandError> {
        task_id(attributes).map(|_| ())
    }

    async fn on_body_complete(
        &self,
        command: Entity,
        cx: &mut CommandCx<'_>,
    ) -> Result<(), CommandFailure> {
        let id = task_id(&command.attributes)?;
        let services = cx.services;
        let who = cx.session.who()?;

        if !services
            .authorizer
            .authorize_resource(who, &command.name, "task", id)?
        {
            return Err(CommandError::permission_denied().into());
        }
        let task = services
            .store
            .find("task", id)?
            .ok_or_else(|| CommandError::not_found("task", id))?;

        let created = services.store.create_report(&task, &who.username)?;
        let report = &created.report;
        let entry = ScanEntry::new(report.id.clone(), report.row, task.row, who.username.clone());
        if let Err(err) = services.scan_queue.enqueue(entry) {
            error!(report_id = %report.id, error = %err, "failed to queue scan; withdrawing report");
            if let Err(withdraw) = services.store.withdraw_report(&task, &created) {
                error!(report_id = %report.id, error = %withdraw, "failed to withdraw report");
            }
            return Err(match err {
                QueueError::AlreadyQueued(_) => CommandError::syntax("Task is active already"),
                _ => CommandError::internal(),
            }
            .into());
        }
        info!(task_id = id, report_id = %report.id, user = %who.username, "scan requested");

        let body = format!(
            "{}{}{}",
            open_response(&command.name, STATUS_OK_REQUESTED, "OK, request submitted"),
            text_element("report_id", &report.id),
            close_response(&command.name)
        );
        cx.emit(&body).await?;
        Ok(())
    }
}
