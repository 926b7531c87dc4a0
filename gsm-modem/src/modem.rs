//! The modem session: one serial port, one outstanding AT command at a time.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::commands::{self, NetworkInfo, SimStatus};
use crate::config::{SessionConfig, Timeouts};
use crate::errors::{ModemError, Result};
use crate::events::{self, EventKind, EventListeners, ModemEvent};
use crate::pdu;
use crate::serial_port::{PortSettings, SerialPortOpener};
use crate::sms::{self, MessageStatus, SmsMessage, SmsMode};
use crate::transport::{PortOpener, SerialStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Closed,
    /// The port is open and the initialization sequence is running.
    Opening,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SimInfo {
    pub imsi: Option<String>,
    pub status: SimStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModemInfo {
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub imei: Option<String>,
}

/// A session with a GSM modem.
///
/// Apart from [`GsmModem::open`] and [`GsmModem::execute_command`], operations
/// never fail: transport and protocol failures turn into `false`, `None` or an
/// empty list, and are logged when the session runs in debug mode.
pub struct GsmModem {
    opener: Arc<dyn PortOpener>,
    transport: Option<SerialStream>,
    state: SessionState,
    sms_mode: SmsMode,
    debug: bool,
    timeouts: Timeouts,
    charset: String,
    listeners: EventListeners,
}

impl GsmModem {
    /// Creates a closed session that opens real serial devices.
    pub fn new(config: SessionConfig) -> Self {
        Self::with_opener(config, Arc::new(SerialPortOpener))
    }

    pub fn with_opener(config: SessionConfig, opener: Arc<dyn PortOpener>) -> Self {
        Self {
            opener,
            transport: None,
            state: SessionState::Closed,
            sms_mode: config.sms_mode,
            debug: config.debug,
            timeouts: config.timeouts,
            charset: config.charset,
            listeners: EventListeners::default(),
        }
    }

    /// Opens `port` and runs the initialization sequence.
    ///
    /// On failure the port is released again and the session stays closed.
    pub fn open(&mut self, port: &str, settings: &PortSettings) -> Result<()> {
        if self.transport.is_some() {
            return Err(ModemError::AlreadyOpen);
        }

        self.state = SessionState::Opening;
        let mut transport = SerialStream::new(port, settings.clone(), Arc::clone(&self.opener))
            .with_poll_interval(self.timeouts.poll_interval);
        if let Err(e) = transport.open() {
            self.state = SessionState::Closed;
            self.log_failure("open", &e);
            return Err(e.into());
        }
        self.transport = Some(transport);

        if let Err(e) = self.initialize() {
            self.log_failure("initialize", &e);
            self.release();
            return Err(e);
        }

        self.state = SessionState::Ready;
        debug!(port, "modem session ready");
        self.emit(&ModemEvent::ModemConnected {
            port: port.to_string(),
        });

        Ok(())
    }

    fn initialize(&mut self) -> Result<()> {
        let mode_command = format_mode_command(self.sms_mode);
        let indication = format!(
            "{}{}",
            commands::SET_SMS_INDICATION,
            commands::SMS_INDICATION_ARGS
        );

        for command in [
            commands::AT,
            commands::ECHO_OFF,
            indication.as_str(),
            commands::ENABLE_CALLER_ID,
            mode_command.as_str(),
        ] {
            self.transact(command, self.timeouts.command)?;
        }

        Ok(())
    }

    /// Releases the port. Closing a closed session does nothing.
    pub fn close(&mut self) {
        if self.release() {
            debug!("modem session closed");
            self.emit(&ModemEvent::ModemDisconnected);
        }
    }

    fn release(&mut self) -> bool {
        self.state = SessionState::Closed;
        match self.transport.take() {
            Some(mut transport) => {
                transport.close();
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == SessionState::Ready
            && self.transport.as_ref().is_some_and(SerialStream::is_open)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn sms_mode(&self) -> SmsMode {
        self.sms_mode
    }

    /// Selects the mode used by later sends and inbox listings. Nothing is
    /// sent to the modem until then.
    pub fn set_sms_mode(&mut self, mode: SmsMode) {
        self.sms_mode = mode;
    }

    /// Sends `command` and returns the raw reply.
    ///
    /// Reads until `OK` or `timeout`. A reply with neither `OK` nor `ERROR`
    /// gets one more short read waiting for `ERROR`. Classifying the reply is
    /// left to the caller.
    pub fn execute_command(&mut self, command: &str, timeout: Duration) -> Result<String> {
        if self.state != SessionState::Ready {
            return Err(ModemError::NotConnected);
        }

        self.transact(command, timeout)
    }

    fn transact(&mut self, command: &str, timeout: Duration) -> Result<String> {
        let debug = self.debug;
        let fallback = self.timeouts.error_fallback;
        let transport = self.transport.as_mut().ok_or(ModemError::NotConnected)?;
        if debug {
            debug!(command, "sending AT command");
        }

        transport.flush()?;
        transport.write(commands::format_command(command).as_bytes())?;

        let mut reply = transport.read_until(commands::OK.as_bytes(), timeout)?;
        if !contains_status(&reply) {
            reply.extend(transport.read_until(commands::ERROR.as_bytes(), fallback)?);
        }
        let response = String::from_utf8_lossy(&reply).into_owned();
        if debug {
            debug!(command, %response, "received AT response");
        }

        Ok(response)
    }

    /// Runs `command` and reports whether the modem answered `OK`.
    fn command_succeeds(&mut self, command: &str) -> Result<bool> {
        let response = self.execute_command(command, self.timeouts.command)?;
        Ok(commands::is_success_response(&response))
    }

    fn command(&mut self, command: &str) -> Result<String> {
        self.execute_command(command, self.timeouts.command)
    }

    fn select_mode(&mut self, mode: SmsMode) -> Result<String> {
        self.command(&format_mode_command(mode))
    }

    pub fn send_sms(&mut self, number: &str, message: &str) -> bool {
        let result = match self.sms_mode {
            SmsMode::Text => self.send_sms_text(number, message),
            SmsMode::Pdu => self.send_sms_pdu(number, message),
        };
        self.settle("send SMS", result)
    }

    fn send_sms_text(&mut self, number: &str, message: &str) -> Result<bool> {
        self.select_mode(SmsMode::Text)?;
        let charset = format!("{}\"{}\"", commands::SET_SMS_CHARSET, self.charset);
        self.command(&charset)?;

        let submit = format!("{}\"{number}\"", commands::SEND_SMS);
        self.submit(&submit, message)
    }

    fn send_sms_pdu(&mut self, number: &str, message: &str) -> Result<bool> {
        self.select_mode(SmsMode::Pdu)?;
        let pdu = pdu::encode_pdu(number, message)?;

        let submit = format!("{}{}", commands::SEND_SMS, pdu::tpdu_length(&pdu));
        self.submit(&submit, &pdu)
    }

    /// Issues `AT+CMGS`, waits for the prompt and hands over the payload.
    fn submit(&mut self, command: &str, payload: &str) -> Result<bool> {
        let Timeouts {
            prompt_delay,
            sms_send,
            ..
        } = self.timeouts;
        let debug = self.debug;
        let transport = self.transport.as_mut().ok_or(ModemError::NotConnected)?;
        if debug {
            debug!(command, "submitting message");
        }

        transport.flush()?;
        transport.write(commands::format_command(command).as_bytes())?;
        thread::sleep(prompt_delay);
        // Drops the `> ` prompt so only the payload's answer is read below.
        transport.flush()?;

        let mut body = payload.as_bytes().to_vec();
        body.push(commands::CTRL_Z);
        transport.write(&body)?;

        let reply = transport.read_until(commands::OK.as_bytes(), sms_send)?;
        let response = String::from_utf8_lossy(&reply);
        if debug {
            debug!(%response, "message submission answered");
        }

        Ok(commands::is_success_response(&response))
    }

    /// Every stored message.
    pub fn get_inbox(&mut self) -> Vec<SmsMessage> {
        self.get_messages(MessageStatus::All)
    }

    pub fn get_messages(&mut self, status: MessageStatus) -> Vec<SmsMessage> {
        let result = match self.sms_mode {
            SmsMode::Text => self.list_text(status),
            SmsMode::Pdu => self.list_pdu(status),
        };
        self.settle("list messages", result)
    }

    fn list_text(&mut self, status: MessageStatus) -> Result<Vec<SmsMessage>> {
        self.select_mode(SmsMode::Text)?;
        let response = self.command(&format!("{}{}", commands::LIST_SMS, status.text_arg()))?;

        Ok(sms::parse_text_listing(&response))
    }

    fn list_pdu(&mut self, status: MessageStatus) -> Result<Vec<SmsMessage>> {
        self.select_mode(SmsMode::Pdu)?;
        let response = self.command(&format!("{}{}", commands::LIST_SMS, status.pdu_code()))?;

        let (messages, skipped) = sms::parse_pdu_listing(&response);
        for entry in &skipped {
            self.log_failure(&format!("decode message {}", entry.index), &entry.error);
        }

        Ok(messages)
    }

    /// Reads the message stored at `index`.
    pub fn read_message(&mut self, index: u32) -> Option<SmsMessage> {
        let result = self.read_stored(index);
        self.settle("read message", result)
    }

    fn read_stored(&mut self, index: u32) -> Result<Option<SmsMessage>> {
        let read = format!("{}{index}", commands::READ_SMS);
        match self.sms_mode {
            SmsMode::Text => {
                self.select_mode(SmsMode::Text)?;
                let response = self.command(&read)?;
                Ok(sms::parse_text_read(index, &response))
            }
            SmsMode::Pdu => {
                self.select_mode(SmsMode::Pdu)?;
                let response = self.command(&read)?;
                Ok(sms::parse_pdu_read(index, &response)?)
            }
        }
    }

    pub fn delete_message(&mut self, index: u32) -> bool {
        let result = self.command_succeeds(&format!("{}{index}", commands::DELETE_SMS));
        self.settle("delete message", result)
    }

    /// Deletes every stored message with `AT+CMGDA`, which is only defined in
    /// TEXT mode.
    pub fn delete_all_messages(&mut self) -> bool {
        let result = self.select_mode(SmsMode::Text).and_then(|_| {
            self.command_succeeds(&format!(
                "{}{}",
                commands::DELETE_ALL_SMS,
                commands::DELETE_ALL_MARKER
            ))
        });
        self.settle("delete all messages", result)
    }

    /// Selects `memory` for reading, writing and receiving messages.
    pub fn set_preferred_storage(&mut self, memory: &str) -> bool {
        let command = format!("{}\"{memory}\",\"{memory}\",\"{memory}\"", commands::SET_STORAGE);
        let result = self.command_succeeds(&command);
        self.settle("set preferred storage", result)
    }

    /// Signal quality in percent.
    pub fn get_signal_strength(&mut self) -> Option<u8> {
        let result = self
            .command(commands::GET_SIGNAL)
            .map(|response| commands::parse_signal_strength(&response));
        self.settle("get signal strength", result)
    }

    pub fn get_network_info(&mut self) -> Option<NetworkInfo> {
        let result = self
            .command(commands::GET_NETWORK)
            .map(|response| commands::parse_network_info(&response));
        self.settle("get network info", result)
    }

    pub fn get_own_number(&mut self) -> Option<String> {
        let result = self
            .command(commands::GET_OWN_NUMBER)
            .map(|response| commands::parse_own_number(&response));
        self.settle("get own number", result)
    }

    /// Dials `number` as a voice call.
    pub fn make_call(&mut self, number: &str) -> bool {
        let result = self.command_succeeds(&format!("{}{number};", commands::DIAL));
        self.settle("make call", result)
    }

    pub fn hangup(&mut self) -> bool {
        let result = self.command_succeeds(commands::HANGUP);
        self.settle("hang up", result)
    }

    pub fn answer_call(&mut self) -> bool {
        let result = self.command_succeeds(commands::ANSWER);
        self.settle("answer call", result)
    }

    /// Sends a USSD request such as `*100#` and returns the network's reply.
    pub fn send_ussd(&mut self, code: &str) -> Option<String> {
        let command = format!("{}1,\"{code}\",15", commands::SEND_USSD);
        let timeout = self.timeouts.ussd;
        let result = self
            .execute_command(&command, timeout)
            .map(|response| commands::parse_ussd_response(&response));
        let reply = self.settle("send USSD", result)?;
        self.emit(&ModemEvent::UssdResponse(reply.clone()));

        Some(reply)
    }

    pub fn get_sim_info(&mut self) -> Option<SimInfo> {
        let result = self.sim_info();
        self.settle("get SIM info", result)
    }

    fn sim_info(&mut self) -> Result<Option<SimInfo>> {
        let imsi = commands::parse_identity(&self.command(commands::GET_IMSI)?);
        let status = commands::parse_sim_status(&self.command(commands::GET_SIM_STATUS)?);

        Ok(Some(SimInfo { imsi, status }))
    }

    pub fn unlock_sim(&mut self, pin: &str) -> bool {
        let result = self.command_succeeds(&format!("{}\"{pin}\"", commands::UNLOCK_PIN));
        self.settle("unlock SIM", result)
    }

    pub fn get_modem_info(&mut self) -> Option<ModemInfo> {
        let result = self.modem_info();
        self.settle("get modem info", result)
    }

    fn modem_info(&mut self) -> Result<Option<ModemInfo>> {
        let manufacturer = commands::parse_manufacturer(&self.command(commands::GET_MANUFACTURER)?);
        let model = commands::parse_model(&self.command(commands::GET_MODEL)?);
        let imei = commands::parse_identity(&self.command(commands::GET_IMEI)?);

        Ok(Some(ModemInfo {
            manufacturer,
            model,
            imei,
        }))
    }

    /// Registers `handler` for events of `kind`.
    pub fn on(&mut self, kind: EventKind, handler: impl FnMut(&ModemEvent) + Send + 'static) {
        self.listeners.on(kind, handler);
    }

    /// Runs the handlers registered for the event's kind, in registration
    /// order.
    pub fn emit(&mut self, event: &ModemEvent) {
        self.listeners.emit(event);
    }

    /// Reads unsolicited result codes for up to `timeout`, emits an event for
    /// each one recognised and returns them. Other lines are dropped.
    pub fn poll_events(&mut self, timeout: Duration) -> Vec<ModemEvent> {
        let result = self.read_unsolicited(timeout);
        let events = self.settle("poll events", result);
        for event in &events {
            self.emit(event);
        }

        events
    }

    fn read_unsolicited(&mut self, timeout: Duration) -> Result<Vec<ModemEvent>> {
        if self.state != SessionState::Ready {
            return Err(ModemError::NotConnected);
        }
        let debug = self.debug;
        let transport = self.transport.as_mut().ok_or(ModemError::NotConnected)?;
        let deadline = Instant::now() + timeout;
        let mut events = Vec::new();

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(line) = transport.read_line(remaining)? else {
                break;
            };
            match events::parse_unsolicited(&line) {
                Some(event) => events.push(event),
                None if debug && !line.trim().is_empty() => {
                    debug!(%line, "ignoring unrecognised line")
                }
                None => {}
            }
            if remaining.is_zero() {
                break;
            }
        }

        Ok(events)
    }

    /// Maps a failed operation onto its empty result.
    fn settle<T: Default>(&self, operation: &str, result: Result<T>) -> T {
        result.unwrap_or_else(|e| {
            self.log_failure(operation, &e);
            T::default()
        })
    }

    fn log_failure(&self, operation: &str, error: &dyn std::error::Error) {
        if self.debug {
            warn!(operation, error = %error, "modem operation failed");
        }
    }
}

impl std::fmt::Debug for GsmModem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GsmModem")
            .field("transport", &self.transport)
            .field("state", &self.state)
            .field("sms_mode", &self.sms_mode)
            .field("debug", &self.debug)
            .field("timeouts", &self.timeouts)
            .field("listeners", &self.listeners)
            .finish_non_exhaustive()
    }
}

impl Drop for GsmModem {
    fn drop(&mut self) {
        self.release();
    }
}

fn contains_status(reply: &[u8]) -> bool {
    let text = String::from_utf8_lossy(reply);
    text.contains(commands::OK) || text.contains(commands::ERROR)
}

fn format_mode_command(mode: SmsMode) -> String {
    format!("{}{}", commands::SET_SMS_FORMAT, mode.cmgf_value())
}
