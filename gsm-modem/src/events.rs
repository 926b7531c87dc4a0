//! Modem events and synchronous listener dispatch.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

static CMTI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\+CMTI:\s*"([^"]*)",\s*(\d+)"#).expect("valid regex"));
static CLIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\+CLIP:\s*"([^"]*)""#).expect("valid regex"));
static CUSD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\+CUSD:\s*\d+,"([^"]*)""#).expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessage,
    IncomingCall,
    UssdResponse,
    ModemConnected,
    ModemDisconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    /// A message was stored at `index` of `storage` (`+CMTI`).
    NewMessage { storage: String, index: u32 },
    /// `RING`, or `+CLIP` carrying the caller's number.
    IncomingCall { number: Option<String> },
    UssdResponse(String),
    ModemConnected { port: String },
    ModemDisconnected,
}

impl ModemEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewMessage { .. } => EventKind::NewMessage,
            Self::IncomingCall { .. } => EventKind::IncomingCall,
            Self::UssdResponse(_) => EventKind::UssdResponse,
            Self::ModemConnected { .. } => EventKind::ModemConnected,
            Self::ModemDisconnected => EventKind::ModemDisconnected,
        }
    }
}

/// Interprets one unsolicited result code line.
pub fn parse_unsolicited(line: &str) -> Option<ModemEvent> {
    let line = line.trim();
    if line == "RING" {
        return Some(ModemEvent::IncomingCall { number: None });
    }
    if let Some(caps) = CMTI_RE.captures(line) {
        return Some(ModemEvent::NewMessage {
            storage: caps[1].to_string(),
            index: caps[2].parse().ok()?,
        });
    }
    if let Some(caps) = CLIP_RE.captures(line) {
        let number = Some(caps[1].to_string()).filter(|n| !n.is_empty());
        return Some(ModemEvent::IncomingCall { number });
    }
    CUSD_RE
        .captures(line)
        .map(|caps| ModemEvent::UssdResponse(caps[1].to_string()))
}

pub type Handler = Box<dyn FnMut(&ModemEvent) + Send>;

/// Handlers registered per [`EventKind`].
///
/// Handlers run synchronously in registration order. A panicking handler is
/// not isolated from the emitter or from the handlers after it.
#[derive(Default)]
pub struct EventListeners {
    handlers: HashMap<EventKind, Vec<Handler>>,
}

impl EventListeners {
    pub fn on(&mut self, kind: EventKind, handler: impl FnMut(&ModemEvent) + Send + 'static) {
        self.handlers.entry(kind).or_default().push(Box::new(handler));
    }

    pub fn emit(&mut self, event: &ModemEvent) {
        if let Some(handlers) = self.handlers.get_mut(&event.kind()) {
            for handler in handlers {
                handler(event);
            }
        }
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<_, _> = self.handlers.iter().map(|(k, v)| (k, v.len())).collect();
        f.debug_struct("EventListeners").field("handlers", &counts).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_parse_unsolicited() {
        assert_eq!(
            parse_unsolicited("+CMTI: \"SM\",3\r"),
            Some(ModemEvent::NewMessage {
                storage: "SM".to_string(),
                index: 3
            })
        );
        assert_eq!(
            parse_unsolicited("RING"),
            Some(ModemEvent::IncomingCall { number: None })
        );
        assert_eq!(
            parse_unsolicited("+CLIP: \"+491701234567\",145,\"\",,\"\",0"),
            Some(ModemEvent::IncomingCall {
                number: Some("+491701234567".to_string())
            })
        );
        assert_eq!(
            parse_unsolicited("+CLIP: \"\",128"),
            Some(ModemEvent::IncomingCall { number: None })
        );
        assert_eq!(
            parse_unsolicited("+CUSD: 0,\"Your balance is 3 EUR\",15"),
            Some(ModemEvent::UssdResponse("Your balance is 3 EUR".to_string()))
        );
        assert_eq!(parse_unsolicited("OK"), None);
        assert_eq!(parse_unsolicited(""), None);
    }

    #[test]
    fn test_handlers_run_in_registration_order_per_kind() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut listeners = EventListeners::default();
        for id in 0..3 {
            let seen = Arc::clone(&seen);
            listeners.on(EventKind::NewMessage, move |event| {
                if let ModemEvent::NewMessage { index, .. } = event {
                    seen.lock().unwrap().push((id, *index));
                }
            });
        }
        let calls = Arc::clone(&seen);
        listeners.on(EventKind::IncomingCall, move |_| calls.lock().unwrap().push((99, 0)));

        listeners.emit(&ModemEvent::NewMessage {
            storage: "SM".to_string(),
            index: 7,
        });
        listeners.emit(&ModemEvent::ModemDisconnected);

        assert_eq!(*seen.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7)]);
        assert_eq!(listeners.count(EventKind::NewMessage), 3);
        assert_eq!(listeners.count(EventKind::UssdResponse), 0);
    }
}
