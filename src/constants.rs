use std::time::Duration;

/// Максимальный размер одного исходящего сообщения (байты).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;
/// Количество слотов в очереди отправки.
pub const QUEUE_CAPACITY: usize = 8;

/// Ёмкость буферов секретов и текстов ошибок, включая завершающий NUL.
pub const MAX_TEXT_SIZE: usize = 256;
/// Максимальная длина application id (с учётом NUL).
pub const MAX_APPLICATION_ID_SIZE: usize = 64;

/// Нижняя граница задержки переподключения.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_millis(500);
/// Верхняя граница задержки переподключения.
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
/// Максимальное ожидание фонового I/O потока между тиками.
pub const IO_WAIT: Duration = Duration::from_millis(500);

/// Версия RPC протокола, отправляемая в handshake.
pub const RPC_VERSION: u32 = 1;
/// Размер заголовка кадра: opcode u32 LE + length u32 LE.
pub const FRAME_HEADER_SIZE: usize = 8;
/// Количество пронумерованных сокетов `discord-ipc-N`, которые перебираются при подключении.
pub const PIPE_SLOTS: u32 = 10;
pub const PIPE_PREFIX: &str = "discord-ipc-";

/// Имена событий хоста.
pub const EVENT_ERROR: &str = "ERROR";
pub const EVENT_READY: &str = "READY";
pub const EVENT_PRESENCE_REQUESTED: &str = "PRESENCE_REQUESTED";
pub const EVENT_JOIN_GAME: &str = "JOIN_GAME";
pub const EVENT_SPECTATE_GAME: &str = "SPECTATE_GAME";

/// Команды RPC.
pub const CMD_DISPATCH: &str = "DISPATCH";
pub const CMD_SUBSCRIBE: &str = "SUBSCRIBE";
pub const CMD_SET_ACTIVITY: &str = "SET_ACTIVITY";
pub const CMD_SEND_JOIN_INVITE: &str = "SEND_ACTIVITY_JOIN_INVITE";
pub const CMD_CLOSE_JOIN_REQUEST: &str = "CLOSE_ACTIVITY_JOIN_REQUEST";
