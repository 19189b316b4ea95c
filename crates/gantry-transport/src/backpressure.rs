use std::time::{Duration, Instant};

/// 统计出站路径的背压停顿。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 出站缓冲写满后，会话会同步排空它；每次排空遇到 `WouldBlock` 都意味着
///   客户端读取跟不上。把这些停顿聚合成一次报告，便于在日志里识别慢客户端，
///   又不会为每次 `WouldBlock` 刷屏。
///
/// ## 逻辑 (How)
/// - `on_stall` 记录首次停顿时间并累加计数；
/// - `on_drained` 在缓冲排空时返回本轮统计并清零；若本轮没有停顿则返回 `None`。
///
/// ## 契约 (What)
/// - 调用方需在同一任务内串行调用，内部不做同步。
#[derive(Debug, Default)]
pub(crate) struct BackpressureMeter {
    stalls: u32,
    first_stall: Option<Instant>,
}

/// 一轮排空过程中累计的停顿。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StallReport {
    pub stalls: u32,
    pub waited: Duration,
}

impl BackpressureMeter {
    pub(crate) fn on_stall(&mut self) {
        self.stalls = self.stalls.saturating_add(1);
        self.first_stall.get_or_insert_with(Instant::now);
    }

    pub(crate) fn on_drained(&mut self) -> Option<StallReport> {
        let first = self.first_stall.take()?;
        let report = StallReport {
            stalls: self.stalls,
            waited: first.elapsed(),
        };
        self.stalls = 0;
        Some(report)
    }

    /// 停顿时长超过该阈值时以 `warn` 级别记录。
    pub(crate) const SLOW_PEER: Duration = Duration::from_secs(5);
}
