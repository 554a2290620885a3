/// Application name
pub const APP_NAME: &str = "Soirée";

/// Reserved sender id carried by group system messages
pub const SYSTEM_SENDER: &str = "system";

/// Maximum inbound WebSocket frame size in bytes
pub const MAX_INBOUND_FRAME_SIZE: usize = 4096;

/// Pending outbound payloads per session before the session is evicted
pub const SEND_BUFFER_CAPACITY: usize = 256;

/// Interval between server pings
pub const PING_INTERVAL_SECS: u64 = 54;

/// A pong must arrive within this window or the session is closed
pub const PONG_WAIT_SECS: u64 = 60;

/// Upper bound on a single socket write
pub const WRITE_WAIT_SECS: u64 = 10;

/// Presence idle timeout (4 minutes)
pub const PRESENCE_IDLE_SECS: u64 = 240;

/// Presence garbage-collection period (1 hour)
pub const PRESENCE_SWEEP_SECS: u64 = 3600;

/// Message pagination
pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 100;

/// User search
pub const DEFAULT_SEARCH_LIMIT: u32 = 10;
pub const MAX_SEARCH_LIMIT: u32 = 50;
pub const MIN_SEARCH_QUERY_CHARS: usize = 2;

/// Push tokens per `PushSink::send_to_all` call
pub const PUSH_BATCH_SIZE: usize = 500;

/// Visible characters of a chat push body
pub const PUSH_BODY_MAX_CHARS: usize = 100;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8090;
