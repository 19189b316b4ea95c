mod common;

use common::*;
use gantry_protocol::auth::Authenticator;
use gantry_protocol::catalog::MemoryStore;
use gantry_protocol::query::QueryDescriptor;
use gantry_protocol::resources::kind;
use gantry_protocol::store::{
    CreatedReport, ResourceIterator, ResourceStore, RowRef, StoreError,
};
use gantry_protocol::xml::Attributes;
use gantry_protocol::{
    CommandCx, CommandFailure, PageSummary, Responder, SessionState, list_resources,
    standard_registry,
};
use gantry_transport::IoBuffer;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// 记录计数调用次数、可注入迭代失败的存储。
struct CountingStore {
    inner: MemoryStore,
    counts: AtomicUsize,
    fail_iteration: bool,
}

impl CountingStore {
    fn new(fail_iteration: bool) -> Self {
        Self {
            inner: MemoryStore::new(seeded_catalog()),
            counts: AtomicUsize::new(0),
            fail_iteration,
        }
    }
}

impl ResourceStore for CountingStore {
    fn iterate(&self, query: &QueryDescriptor) -> Result<Box<dyn ResourceIterator>, StoreError> {
        if self.fail_iteration {
            return Err(StoreError::internal("cursor vanished"));
        }
        self.inner.iterate(query)
    }

    fn count(&self, query: &QueryDescriptor) -> Result<u64, StoreError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.inner.count(query)
    }

    fn find(&self, resource_type: &str, id: &str) -> Result<Option<RowRef>, StoreError> {
        self.inner.find(resource_type, id)
    }

    fn get_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
    ) -> Result<Option<String>, StoreError> {
        self.inner.get_field(resource_type, id, field)
    }

    fn set_field(
        &self,
        resource_type: &str,
        id: &str,
        field: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        self.inner.set_field(resource_type, id, field, value)
    }

    fn saved_filter(&self, filter_id: &str) -> Result<Option<String>, StoreError> {
        self.inner.saved_filter(filter_id)
    }

    fn create_report(&self, task: &RowRef, owner: &str) -> Result<CreatedReport, StoreError> {
        self.inner.create_report(task, owner)
    }

    fn withdraw_report(&self, task: &RowRef, created: &CreatedReport) -> Result<(), StoreError> {
        self.inner.withdraw_report(task, created)
    }
}

async fn list_as(
    user: &str,
    services: &gantry_protocol::Services,
    attributes: &[(&str, &str)],
) -> (Result<PageSummary, CommandFailure>, String) {
    let registry = standard_registry();
    let credentials = users()
        .authenticate(user, &format!("{user}-pw"))
        .unwrap()
        .expect("seeded user");
    let mut session = SessionState {
        credentials: Some(credentials),
    };
    let mut outbound = IoBuffer::with_capacity(256);
    let mut sink = RecordingSink::with_step(4096);
    let attributes: Attributes = attributes.iter().copied().collect();
    let resource = if attributes.get("task_id").is_some() {
        kind("task")
    } else {
        kind("alert")
    }
    .unwrap();
    let command = resource.list_command();
    let result = {
        let mut cx = CommandCx {
            responder: Responder::new(&mut outbound, &mut sink),
            session: &mut session,
            services,
            registry: &registry,
        };
        list_resources(resource, &command, &attributes, &mut cx).await
    };
    sink.written.extend_from_slice(outbound.readable());
    (result, sink.text())
}

fn command_status(result: Result<PageSummary, CommandFailure>) -> (u16, String) {
    match result {
        Err(CommandFailure::Command(err)) => (err.status, err.text),
        other => panic!("expected a command error, got {other:?}"),
    }
}

#[tokio::test]
async fn second_page_of_one_returns_exactly_row_two() {
    let fixture = fixture();
    let (result, output) = list_as("admin", &fixture.services, &[("first", "2"), ("max", "1")]).await;
    assert_eq!(
        result.unwrap(),
        PageSummary {
            count: 1,
            filtered: 3,
            total: 3
        }
    );
    assert_eq!(output.matches("<alert id=").count(), 1);
    assert!(output.contains(&format!("<alert id=\"{BRAVO}\"><name>bravo</name>")));
    assert!(output.starts_with("<get_alerts_response status=\"200\" status_text=\"OK\">"));
    assert!(output.contains("<alerts start=\"2\" max=\"1\"/>"));
    assert!(output.contains(
        "<alert_count>3<filtered>3</filtered><page>1</page></alert_count></get_alerts_response>"
    ));
}

#[tokio::test]
async fn unknown_id_is_not_found_and_skips_counting() {
    let store = Arc::new(CountingStore::new(false));
    let fixture = fixture_over(Arc::new(MemoryStore::default()), store.clone());
    let (result, output) = list_as("admin", &fixture.services, &[("alert_id", MISSING)]).await;
    assert_eq!(
        command_status(result),
        (404, format!("Failed to find alert '{MISSING}'"))
    );
    assert!(output.is_empty());
    assert_eq!(store.counts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn single_id_short_circuits_filtered_count() {
    let store = Arc::new(CountingStore::new(false));
    let fixture = fixture_over(Arc::new(MemoryStore::default()), store.clone());
    let (result, output) = list_as("admin", &fixture.services, &[("alert_id", CHARLIE)]).await;
    assert_eq!(
        result.unwrap(),
        PageSummary {
            count: 1,
            filtered: 1,
            total: 3
        }
    );
    assert!(output.contains("<name>charlie</name>"));
    assert_eq!(store.counts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn saved_filter_text_is_overridden_by_request_filter() {
    let fixture = fixture();
    let (result, output) =
        list_as("admin", &fixture.services, &[("filt_id", A_FILTER)]).await;
    assert_eq!(
        result.unwrap(),
        PageSummary {
            count: 2,
            filtered: 2,
            total: 3
        }
    );
    assert!(output.contains(&format!("<filters id=\"{A_FILTER}\"><term>name~ha first=1 rows=5 sort=name</term></filters>")));

    let (result, _) = list_as(
        "admin",
        &fixture.services,
        &[("filt_id", A_FILTER), ("filter", "rows=1 sort-reverse=name")],
    )
    .await;
    let summary = result.unwrap();
    assert_eq!((summary.count, summary.filtered), (1, 2));
}

#[tokio::test]
async fn missing_saved_filter_is_not_found() {
    let fixture = fixture();
    let (result, output) = list_as("admin", &fixture.services, &[("filt_id", MISSING)]).await;
    assert_eq!(
        command_status(result),
        (404, format!("Failed to find filter '{MISSING}'"))
    );
    assert!(output.is_empty());
}

#[tokio::test]
async fn foreign_resource_is_permission_denied() {
    let fixture = fixture();
    let (result, _) = list_as("alice", &fixture.services, &[("task_id", ADMIN_TASK)]).await;
    assert_eq!(command_status(result), (403, "Permission denied".to_owned()));

    let (result, output) = list_as("alice", &fixture.services, &[("task_id", ALICE_TASK)]).await;
    assert_eq!(result.unwrap().count, 1);
    assert!(output.contains("<owner>alice</owner>"));
}

#[tokio::test]
async fn iterator_failure_is_an_internal_error() {
    let store = Arc::new(CountingStore::new(true));
    let fixture = fixture_over(Arc::new(MemoryStore::default()), store);
    let (result, output) = list_as("admin", &fixture.services, &[]).await;
    assert_eq!(command_status(result), (500, "Internal error".to_owned()));
    assert!(output.is_empty());
}

#[tokio::test]
async fn internal_error_ends_only_the_command() {
    let store = Arc::new(CountingStore::new(true));
    let fixture = fixture_over(Arc::new(MemoryStore::default()), store);
    let mut harness = Harness::roomy(fixture.services);
    harness.feed(login("admin").as_bytes()).await.unwrap();
    harness
        .feed(b"<get_alerts/><get_version/>")
        .await
        .unwrap();
    let output = harness.output().await;
    assert!(output.contains(
        "<get_alerts_response status=\"500\" status_text=\"Internal error\"/><get_version_response"
    ));
}

#[tokio::test]
async fn trashed_rows_appear_only_with_trash_flag() {
    let mut catalog = seeded_catalog();
    catalog.trash("alert", BRAVO);
    let fixture = fixture_with(catalog);

    let (result, _) = list_as("admin", &fixture.services, &[]).await;
    assert_eq!(result.unwrap().count, 2);

    let (result, output) = list_as("admin", &fixture.services, &[("trash", "1")]).await;
    assert_eq!(result.unwrap().count, 3);
    assert!(output.contains("<name>bravo</name><comment>second</comment>"));
    assert!(output.contains("<trash>1</trash>"));
}

#[tokio::test]
async fn sort_attributes_apply_when_filter_is_silent() {
    let fixture = fixture();
    let (_, output) = list_as(
        "admin",
        &fixture.services,
        &[("sort_field", "severity"), ("sort_order", "descending")],
    )
    .await;
    let alpha = output.find("<name>alpha</name>").unwrap();
    let bravo = output.find("<name>bravo</name>").unwrap();
    let charlie = output.find("<name>charlie</name>").unwrap();
    assert!(alpha < bravo && bravo < charlie);
}

#[tokio::test]
async fn non_numeric_paging_is_a_syntax_error() {
    let fixture = fixture();
    let (result, _) = list_as("admin", &fixture.services, &[("max", "lots")]).await;
    assert_eq!(command_status(result), (400, "Invalid max".to_owned()));
}
