/// Maximum length of a conversation key (`dm:<peer>` / `room:<room>`)
pub const MAX_CONVERSATION_KEY_LEN: usize = 96;

/// Maximum length of a client-generated local id
pub const MAX_LOCAL_ID_LEN: usize = 64;

/// Maximum message text length in characters
pub const MAX_TEXT_CHARS: usize = 4000;

/// Maximum number of conversations kept in the persisted outbox
pub const MAX_OUTBOX_CONVERSATIONS: usize = 80;

/// Maximum number of pending entries kept per conversation
pub const MAX_OUTBOX_PER_CONVERSATION: usize = 60;

/// Maximum number of persisted transfer history entries
pub const MAX_TRANSFER_HISTORY: usize = 200;

/// Outbox document version
pub const OUTBOX_VERSION: u64 = 1;

/// Transfer history document version
pub const TRANSFER_HISTORY_VERSION: u64 = 1;

/// Storage key prefixes (suffixed with `:<user>`)
pub const OUTBOX_STORAGE_PREFIX: &str = "courier_outbox_v1";
pub const TRANSFER_STORAGE_PREFIX: &str = "courier_file_transfers_v1";

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

/// Furthest a regular message may be scheduled ahead (365 days)
pub const MESSAGE_SCHEDULE_MAX_DELAY_MS: i64 = 365 * DAY_MS;

/// Furthest a board post may be scheduled ahead (7 days)
pub const BOARD_SCHEDULE_MAX_DELAY_MS: i64 = 7 * DAY_MS;

/// Window in which a history row without a local id may replace an
/// optimistic message with the same text and destination
pub const HISTORY_MATCH_WINDOW_MS: i64 = 12_000;

/// Server error codes that refer to the last send attempt
pub const SEND_ERROR_CODES: &[&str] = &[
    "not_in_group",
    "group_post_forbidden",
    "board_post_forbidden",
    "board_check_failed",
    "group_check_failed",
    "broadcast_disabled",
    "message_too_long",
    "bad_text",
    "bad_recipient",
    "rate_limited",
];

/// Send error codes after which the same request may succeed later
pub const RETRYABLE_SEND_ERROR_CODES: &[&str] = &["rate_limited"];
