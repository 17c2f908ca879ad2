/// Удобный тип результата для библиотеки.
pub type Result<T> = std::result::Result<T, RpcError>;

/// Ошибки, которые может возвращать библиотека.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    /// В процессе уже есть активная сессия.
    #[error("a session is already initialized in this process")]
    AlreadyInitialized,
    /// Application id пустой или не помещается в буфер.
    #[error("application id must be 1..{max} bytes, got {len}")]
    InvalidApplicationId {
        /// Фактическая длина.
        len: usize,
        /// Допустимый максимум.
        max: usize,
    },
    /// Нижняя граница backoff больше верхней.
    #[error("reconnect delay floor exceeds its ceiling")]
    InvalidBackoff,
    /// Соединение с хостом отсутствует.
    #[error("not connected to the host process")]
    NotConnected,
    /// Очередь отправки заполнена; сообщение отброшено.
    #[error("send queue is full")]
    QueueFull,
    /// Другой поток сейчас пишет в очередь; сообщение отброшено.
    #[error("send queue is being written by another thread")]
    ProducerBusy,
    /// Сообщение не помещается в слот очереди.
    #[error("message does not fit in {max} bytes")]
    MessageTooLarge {
        /// Ёмкость слота.
        max: usize,
    },
    /// Ошибка сериализации JSON.
    #[error("failed to encode message: {0}")]
    Encode(String),
    /// Системная ошибка ввода-вывода.
    #[error("i/o error {kind:?} while {context}")]
    Io {
        /// Тип ошибки.
        kind: std::io::ErrorKind,
        /// Контекст операции.
        context: &'static str,
    },
}

impl RpcError {
    pub(crate) fn io(err: &std::io::Error, context: &'static str) -> Self {
        RpcError::Io {
            kind: err.kind(),
            context,
        }
    }
}

/// Коды, с которыми соединение сообщает об отключении.
///
/// Коды из `Close` кадра хоста передаются как есть и могут выходить за этот набор.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,
    PipeClosed = 1,
    ReadCorrupt = 2,
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code as i32
    }
}
