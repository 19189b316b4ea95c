//! 会话级的定长读写缓冲区。
//!
//! # 教案式说明
//!
//! ## 意图 (Why)
//! - 每条连接持有一对固定容量的缓冲区：入站缓冲吸收部分读取，出站缓冲吸收
//!   尚未写出的响应；容量固定意味着写满即触发背压，而不是无限增长。
//!
//! ## 契约 (What)
//! - 始终满足 `0 <= start <= end <= capacity`；
//! - `start..end` 为待消费字节，`end..capacity` 为可写入空间；
//! - 一旦 `start == end`，两个游标立即归零，避免“空缓冲仍占着尾部空间”。

/// 固定容量、双游标的字节缓冲区。
#[derive(Debug)]
pub struct IoBuffer {
    bytes: Box<[u8]>,
    start: usize,
    end: usize,
}

impl IoBuffer {
    /// 创建指定容量的空缓冲区。容量为 0 时退化为 1，保证始终能推进。
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// 待消费字节数。
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// 尾部可写空间（不含压缩后可回收的前缀）。
    pub fn spare(&self) -> usize {
        self.capacity() - self.end
    }

    /// 已无任何可写空间，即使压缩也无法腾出。
    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    pub fn cursors(&self) -> (usize, usize) {
        (self.start, self.end)
    }

    /// 待消费区间的只读视图。
    pub fn readable(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }

    /// 标记前 `n` 个待消费字节已处理；全部消费后游标归零。
    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.len(), "consume past end of buffered data");
        self.start = (self.start + n).min(self.end);
        if self.start == self.end {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// 把未消费的尾部搬到偏移 0，为读取腾出空间。
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        self.bytes.copy_within(self.start..self.end, 0);
        self.end -= self.start;
        self.start = 0;
    }

    /// 返回尾部可写切片；若尾部已满但前缀可回收，先压缩。
    pub fn writable(&mut self) -> &mut [u8] {
        if self.spare() == 0 {
            self.compact();
        }
        &mut self.bytes[self.end..]
    }

    /// 记录刚写入尾部的 `n` 个字节。
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.spare(), "commit past buffer capacity");
        self.end = (self.end + n).min(self.capacity());
    }

    /// 尽量追加 `data`，返回实际写入的字节数；写不下的部分由调用方先排空再追加。
    pub fn append(&mut self, data: &[u8]) -> usize {
        let slot = self.writable();
        let n = slot.len().min(data.len());
        slot[..n].copy_from_slice(&data[..n]);
        self.commit(n);
        n
    }
}

/// 一条连接的入站/出站缓冲对。
#[derive(Debug)]
pub struct DuplexBuffers {
    pub inbound: IoBuffer,
    pub outbound: IoBuffer,
}

impl DuplexBuffers {
    pub fn new(inbound_capacity: usize, outbound_capacity: usize) -> Self {
        Self {
            inbound: IoBuffer::with_capacity(inbound_capacity),
            outbound: IoBuffer::with_capacity(outbound_capacity),
        }
    }
}
