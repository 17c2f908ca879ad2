//! FFI-интерфейс, совместимый с C-библиотекой discord-rpc.
//!
//! Один сеанс на процесс: повторный `Discord_Initialize` без
//! `Discord_Shutdown` игнорируется.

#![allow(non_snake_case)]

use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::error::RpcError;
use crate::events::EventHandlers;
use crate::serialization::{Reply, RichPresence};
use crate::session::{IoMode, RpcOptions, Session};

pub const DISCORD_REPLY_NO: c_int = 0;
pub const DISCORD_REPLY_YES: c_int = 1;
pub const DISCORD_REPLY_IGNORE: c_int = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct DiscordEventHandlers {
    pub ready: Option<extern "C" fn()>,
    pub disconnected: Option<extern "C" fn(error_code: c_int, message: *const c_char)>,
    pub errored: Option<extern "C" fn(error_code: c_int, message: *const c_char)>,
    pub join_game: Option<extern "C" fn(join_secret: *const c_char)>,
    pub spectate_game: Option<extern "C" fn(spectate_secret: *const c_char)>,
    pub presence_requested: Option<extern "C" fn()>,
}

/// Все строки могут быть NULL, что равносильно пустой строке.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct DiscordRichPresence {
    pub state: *const c_char,
    pub details: *const c_char,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub large_image_key: *const c_char,
    pub large_image_text: *const c_char,
    pub small_image_key: *const c_char,
    pub small_image_text: *const c_char,
    pub party_id: *const c_char,
    pub party_size: c_int,
    pub party_max: c_int,
    pub match_secret: *const c_char,
    pub join_secret: *const c_char,
    pub spectate_secret: *const c_char,
    pub instance: i8,
}

#[repr(C)]
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum discord_status_t {
    DISCORD_SUCCESS = 0,
    DISCORD_ERROR_INVALID_PARAM = -1,
    DISCORD_ERROR_ALREADY_INITIALIZED = -2,
    DISCORD_ERROR_NOT_CONNECTED = -3,
    DISCORD_ERROR_FULL = -4,
    DISCORD_ERROR_IO = -5,
}

impl From<RpcError> for discord_status_t {
    fn from(value: RpcError) -> Self {
        match value {
            RpcError::AlreadyInitialized => discord_status_t::DISCORD_ERROR_ALREADY_INITIALIZED,
            RpcError::InvalidApplicationId { .. }
            | RpcError::InvalidBackoff
            | RpcError::MessageTooLarge { .. }
            | RpcError::Encode(_) => discord_status_t::DISCORD_ERROR_INVALID_PARAM,
            RpcError::NotConnected => discord_status_t::DISCORD_ERROR_NOT_CONNECTED,
            RpcError::QueueFull | RpcError::ProducerBusy => discord_status_t::DISCORD_ERROR_FULL,
            RpcError::Io { .. } => discord_status_t::DISCORD_ERROR_IO,
        }
    }
}

static SESSION: Mutex<Option<Arc<Session>>> = Mutex::new(None);

fn current() -> Option<Arc<Session>> {
    SESSION
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

fn to_rust_str(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let cstr = unsafe { CStr::from_ptr(ptr) };
    cstr.to_string_lossy().into_owned()
}

fn c_text(text: &str) -> CString {
    CString::new(text).unwrap_or_default()
}

impl DiscordEventHandlers {
    fn into_handlers(self) -> EventHandlers {
        EventHandlers {
            ready: self.ready.map(|cb| Box::new(move || cb()) as Box<dyn Fn() + Send + Sync>),
            disconnected: self.disconnected.map(|cb| {
                Box::new(move |code: i32, message: &str| cb(code, c_text(message).as_ptr()))
                    as Box<dyn Fn(i32, &str) + Send + Sync>
            }),
            errored: self.errored.map(|cb| {
                Box::new(move |code: i32, message: &str| cb(code, c_text(message).as_ptr()))
                    as Box<dyn Fn(i32, &str) + Send + Sync>
            }),
            presence_requested: self
                .presence_requested
                .map(|cb| Box::new(move || cb()) as Box<dyn Fn() + Send + Sync>),
            join_game: self.join_game.map(|cb| {
                Box::new(move |secret: &str| cb(c_text(secret).as_ptr()))
                    as Box<dyn Fn(&str) + Send + Sync>
            }),
            spectate_game: self.spectate_game.map(|cb| {
                Box::new(move |secret: &str| cb(c_text(secret).as_ptr()))
                    as Box<dyn Fn(&str) + Send + Sync>
            }),
        }
    }
}

impl DiscordRichPresence {
    fn to_presence(&self) -> RichPresence {
        RichPresence {
            state: to_rust_str(self.state),
            details: to_rust_str(self.details),
            start_timestamp: self.start_timestamp,
            end_timestamp: self.end_timestamp,
            large_image_key: to_rust_str(self.large_image_key),
            large_image_text: to_rust_str(self.large_image_text),
            small_image_key: to_rust_str(self.small_image_key),
            small_image_text: to_rust_str(self.small_image_text),
            party_id: to_rust_str(self.party_id),
            party_size: self.party_size,
            party_max: self.party_max,
            match_secret: to_rust_str(self.match_secret),
            join_secret: to_rust_str(self.join_secret),
            spectate_secret: to_rust_str(self.spectate_secret),
            instance: self.instance != 0,
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_Initialize(
    application_id: *const c_char,
    handlers: *const DiscordEventHandlers,
    manual_io: c_int,
) -> discord_status_t {
    let mut slot = SESSION.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_some() {
        warn!("Discord_Initialize called twice; ignoring");
        return discord_status_t::DISCORD_ERROR_ALREADY_INITIALIZED;
    }
    if application_id.is_null() {
        return discord_status_t::DISCORD_ERROR_INVALID_PARAM;
    }
    let handlers = if handlers.is_null() {
        DiscordEventHandlers::default()
    } else {
        unsafe { *handlers }
    };
    let options = RpcOptions {
        io_mode: if manual_io != 0 {
            IoMode::Manual
        } else {
            IoMode::Managed
        },
        ..RpcOptions::new(to_rust_str(application_id))
    };
    match Session::initialize(options, handlers.into_handlers()) {
        Ok(session) => {
            *slot = Some(Arc::new(session));
            discord_status_t::DISCORD_SUCCESS
        }
        Err(err) => {
            warn!(%err, "Discord_Initialize failed");
            err.into()
        }
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_Shutdown() {
    let session = SESSION.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(session) = session {
        session.shutdown();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_RunCallbacks() {
    if let Some(session) = current() {
        session.run_callbacks();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_UpdateConnection() {
    if let Some(session) = current() {
        session.update_connection();
    }
}

/// NULL очищает presence, как и `Discord_ClearPresence`.
#[unsafe(no_mangle)]
pub extern "C" fn Discord_UpdatePresence(presence: *const DiscordRichPresence) {
    let Some(session) = current() else {
        return;
    };
    if presence.is_null() {
        session.clear_presence();
    } else {
        let presence = unsafe { &*presence }.to_presence();
        session.update_presence(&presence);
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_ClearPresence() {
    if let Some(session) = current() {
        session.clear_presence();
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn Discord_Respond(user_id: *const c_char, reply: c_int) {
    if user_id.is_null() {
        return;
    }
    let reply = match reply {
        DISCORD_REPLY_NO => Reply::No,
        DISCORD_REPLY_YES => Reply::Yes,
        _ => Reply::Ignore,
    };
    if let Some(session) = current() {
        session.respond(&to_rust_str(user_id), reply);
    }
}
