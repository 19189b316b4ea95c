//! 集成测试共用的夹具：预置目录、用户表与记录输出的出站端。
#![allow(dead_code)]

use async_trait::async_trait;
use gantry_protocol::auth::{Role, RoleAuthorizer, UserRecord, UserTable, digest};
use gantry_protocol::catalog::{Catalog, MemoryStore};
use gantry_protocol::store::ResourceStore;
use gantry_protocol::{EngineError, ProtocolEngine, ProtocolSettings, Services, standard_registry};
use gantry_scan::{MemoryScanQueue, ScanQueue};
use gantry_transport::{IoBuffer, OutboundSink, TransportError};
use std::sync::Arc;

pub const ALPHA: &str = "a0000000-0000-4000-8000-000000000001";
pub const BRAVO: &str = "a0000000-0000-4000-8000-000000000002";
pub const CHARLIE: &str = "a0000000-0000-4000-8000-000000000003";
pub const ALICE_TASK: &str = "7a5c0000-0000-4000-8000-000000000001";
pub const ADMIN_TASK: &str = "7a5c0000-0000-4000-8000-000000000002";
pub const A_FILTER: &str = "f1000000-0000-4000-8000-000000000001";
pub const MISSING: &str = "00000000-0000-4000-8000-00000000dead";

pub fn login(user: &str) -> String {
    format!(
        "<authenticate><credentials><username>{user}</username>\
         <password>{user}-pw</password></credentials></authenticate>"
    )
}

pub fn seeded_catalog() -> Catalog {
    let mut catalog = Catalog::new();
    // 插入顺序与名字顺序不同，用来确认排序由存储负责。
    catalog.insert_with_id(
        "alert",
        CHARLIE,
        "admin",
        [("name", "charlie"), ("comment", "third"), ("severity", "1")],
    );
    catalog.insert_with_id(
        "alert",
        ALPHA,
        "admin",
        [("name", "alpha"), ("comment", "first"), ("severity", "7")],
    );
    catalog.insert_with_id(
        "alert",
        BRAVO,
        "admin",
        [("name", "bravo"), ("comment", "second"), ("severity", "5")],
    );
    catalog.insert_with_id(
        "task",
        ALICE_TASK,
        "alice",
        [("name", "weekly"), ("status", "New")],
    );
    catalog.insert_with_id(
        "task",
        ADMIN_TASK,
        "admin",
        [("name", "nightly"), ("status", "New")],
    );
    catalog.insert_with_id(
        "filter",
        A_FILTER,
        "admin",
        [("name", "only-a"), ("type", "alert"), ("term", "name~ha rows=5")],
    );
    catalog
}

pub fn users() -> UserTable {
    let user = |name: &str, role| UserRecord {
        id: format!("{name}-uuid"),
        name: name.to_owned(),
        password_sha256: digest(&format!("{name}-pw")),
        role,
        timezone: "UTC".to_owned(),
    };
    UserTable::new(vec![
        user("admin", Role::Admin),
        user("alice", Role::User),
        user("watcher", Role::Observer),
    ])
}

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub queue: Arc<MemoryScanQueue>,
    pub services: Services,
}

pub fn fixture_with(catalog: Catalog) -> Fixture {
    let store = Arc::new(MemoryStore::new(catalog));
    fixture_over(store.clone(), store)
}

/// 以任意存储实现构造服务；`memory` 供测试回读目录。
pub fn fixture_over(memory: Arc<MemoryStore>, store: Arc<dyn ResourceStore>) -> Fixture {
    let queue = Arc::new(MemoryScanQueue::new());
    let services = Services {
        store: store.clone(),
        authenticator: Arc::new(users()),
        authorizer: Arc::new(RoleAuthorizer::new(store)),
        scan_queue: queue.clone() as Arc<dyn ScanQueue>,
        settings: ProtocolSettings::default(),
    };
    Fixture {
        store: memory,
        queue,
        services,
    }
}

pub fn fixture() -> Fixture {
    fixture_with(seeded_catalog())
}

pub fn engine(services: Services) -> ProtocolEngine {
    ProtocolEngine::new(Arc::new(standard_registry()), services)
}

/// 每次只“写出”`step` 个字节的出站端，模拟缓慢的对端。
#[derive(Default)]
pub struct RecordingSink {
    pub written: Vec<u8>,
    pub step: usize,
    pub drains: usize,
}

impl RecordingSink {
    pub fn with_step(step: usize) -> Self {
        Self {
            step: step.max(1),
            ..Self::default()
        }
    }

    pub fn text(&self) -> String {
        String::from_utf8(self.written.clone()).expect("responses are UTF-8")
    }
}

#[async_trait]
impl OutboundSink for RecordingSink {
    async fn drain(&mut self, buf: &mut IoBuffer) -> Result<(), TransportError> {
        self.drains += 1;
        while !buf.is_empty() {
            let n = buf.len().min(self.step.max(1));
            self.written.extend_from_slice(&buf.readable()[..n]);
            buf.consume(n);
            tokio::task::yield_now().await;
        }
        Ok(())
    }
}

/// 按给定切分把输入喂给引擎，返回全部输出。
pub struct Harness {
    pub engine: ProtocolEngine,
    pub inbound: IoBuffer,
    pub outbound: IoBuffer,
    pub sink: RecordingSink,
}

impl Harness {
    pub fn new(services: Services, inbound: usize, outbound: usize, step: usize) -> Self {
        Self {
            engine: engine(services),
            inbound: IoBuffer::with_capacity(inbound),
            outbound: IoBuffer::with_capacity(outbound),
            sink: RecordingSink::with_step(step),
        }
    }

    pub fn roomy(services: Services) -> Self {
        Self::new(services, 64 * 1024, 64 * 1024, 4096)
    }

    /// 送入一段字节；放不下时边处理边送。
    pub async fn feed(&mut self, chunk: &[u8]) -> Result<(), EngineError> {
        let mut rest = chunk;
        loop {
            let n = self.inbound.append(rest);
            rest = &rest[n..];
            self.engine
                .process(&mut self.inbound, &mut self.outbound, &mut self.sink)
                .await?;
            if rest.is_empty() {
                return Ok(());
            }
        }
    }

    /// 排空出站缓冲并返回迄今为止的全部输出。
    pub async fn output(&mut self) -> String {
        self.sink
            .drain(&mut self.outbound)
            .await
            .expect("recording sink never fails");
        self.sink.text()
    }
}

/// 取出 `<name>...</name>` 的文本。
pub fn element_text<'a>(xml: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(&xml[start..end])
}
