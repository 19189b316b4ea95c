use rustls::AlertDescription;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub const BIND: OperationKind = OperationKind {
    code: "gantry.transport.bind_failed",
    message: "listener bind",
};
pub const ACCEPT: OperationKind = OperationKind {
    code: "gantry.transport.accept_failed",
    message: "listener accept",
};
pub const READ: OperationKind = OperationKind {
    code: "gantry.transport.read_failed",
    message: "transport read",
};
pub const WRITE: OperationKind = OperationKind {
    code: "gantry.transport.write_failed",
    message: "transport write",
};
pub const READINESS: OperationKind = OperationKind {
    code: "gantry.transport.readiness_failed",
    message: "transport readiness wait",
};
pub const HANDSHAKE: OperationKind = OperationKind {
    code: "gantry.transport.tls_handshake_failed",
    message: "tls handshake",
};
pub const TLS_READ: OperationKind = OperationKind {
    code: "gantry.transport.tls_read_failed",
    message: "tls read",
};
pub const TLS_WRITE: OperationKind = OperationKind {
    code: "gantry.transport.tls_write_failed",
    message: "tls write",
};
pub const TLS_CONFIG: OperationKind = OperationKind {
    code: "gantry.transport.tls_config_invalid",
    message: "tls configuration",
};

const TLS_ALERT_CODE: &str = "gantry.transport.tls_alert";
const HANDSHAKE_TIMEOUT_CODE: &str = "gantry.transport.tls_handshake_timeout";

/// 传输层统一错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 会话层只关心“连接是否还能继续”，因此所有硬错误被折叠为一个枚举，
///   并附带稳定错误码，便于日志检索；
/// - `WouldBlock`、`Interrupted` 与缓冲区满都不会出现在这里，它们属于正常的
///   进度信号，由 [`ReadStatus`](crate::ReadStatus) / [`WriteStatus`](crate::WriteStatus) 表达。
///
/// ## 契约 (What)
/// - `Io`：套接字或文件 I/O 失败；
/// - `TlsAlert`：对端发送了致命告警（`close_notify` / `user_canceled` 不在此列）；
/// - `Tls`：本端 TLS 状态机拒绝了对端数据；
/// - `HandshakeTimeout`：握手未在限定时间内完成；
/// - `code()` 返回稳定错误码。
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{}: {source}", .op.message)]
    Io {
        op: OperationKind,
        #[source]
        source: io::Error,
    },
    #[error("{}: peer sent fatal alert {alert:?}", .op.message)]
    TlsAlert {
        op: OperationKind,
        alert: AlertDescription,
    },
    #[error("{}: {source}", .op.message)]
    Tls {
        op: OperationKind,
        #[source]
        source: rustls::Error,
    },
    #[error("tls handshake did not finish within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("{}: {detail}", .op.message)]
    Config {
        op: OperationKind,
        detail: String,
    },
}

impl TransportError {
    pub(crate) fn io(op: OperationKind, source: io::Error) -> Self {
        Self::Io { op, source }
    }

    pub(crate) fn config(detail: impl Into<String>) -> Self {
        Self::Config {
            op: TLS_CONFIG,
            detail: detail.into(),
        }
    }

    /// 返回与错误对应的稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io { op, .. } | Self::Tls { op, .. } | Self::Config { op, .. } => op.code,
            Self::TlsAlert { .. } => TLS_ALERT_CODE,
            Self::HandshakeTimeout(_) => HANDSHAKE_TIMEOUT_CODE,
        }
    }

    /// 判断错误是否只是对端断开（复位、管道破裂等），供会话层降低日志级别。
    pub fn is_disconnect(&self) -> bool {
        match self {
            Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// 将 rustls 错误映射为传输错误，并区分“收到告警”与“本端检测到协议违规”。
pub(crate) fn map_tls_error(op: OperationKind, error: rustls::Error) -> TransportError {
    match error {
        rustls::Error::AlertReceived(alert) => TransportError::TlsAlert { op, alert },
        other => TransportError::Tls { op, source: other },
    }
}

/// 告警是否代表正常的流结束。
pub(crate) fn is_closure_alert(alert: AlertDescription) -> bool {
    matches!(
        alert,
        AlertDescription::CloseNotify | AlertDescription::UserCanceled
    )
}
