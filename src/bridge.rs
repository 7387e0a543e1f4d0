// src/bridge.rs
//
// The serial bridge: owns at most one open serial handle, runs the blocking
// read loop on a worker thread and fans each line out to the stream
// subscribers.
//
// Connect, disconnect and exclusive access are serialised by one async
// mutex, so handle open and handle close never interleave. The read loop is
// stopped through a cancel flag that is checked between reads and under the
// subscriber lock; a disconnect therefore waits at most one read timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};
use tokio::task::JoinHandle;

use crate::events::{StreamEvent, SERVER_CLOSING_MESSAGE};
use crate::fanout::{Subscriber, SubscriberId, SubscriberRegistry};
use crate::io::serial::{
    detect_device, LineFramer, LineParams, PortEnumerator, SerialError, SerialLink,
    SerialOpener, SerialPortInfo,
};
use crate::io::ConnectionState;
use crate::settings::SerialSettings;

// ============================================================================
// Types
// ============================================================================

/// Snapshot of the connection, readable without waiting on connect/disconnect
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub state: ConnectionState,
    pub device_path: Option<String>,
    pub baud_rate: Option<u32>,
}

/// What a successful disconnect did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Closed,
    AlreadyInactive,
}

/// How the read loop ended
enum MonitorExit {
    /// Cancelled by a disconnect; carries the result of releasing the handle
    Stopped(Result<(), SerialError>),
    /// The device failed; subscribers were already told and state is Closed
    Failed,
}

struct ActiveMonitor {
    device_path: String,
    cancel_flag: Arc<AtomicBool>,
    task: JoinHandle<MonitorExit>,
}

type MonitorSlot = Option<ActiveMonitor>;

pub struct SerialBridge {
    ports: Arc<dyn PortEnumerator>,
    opener: Arc<dyn SerialOpener>,
    subscribers: Arc<SubscriberRegistry>,
    settings: SerialSettings,
    monitor: AsyncMutex<MonitorSlot>,
    status: Arc<Mutex<MonitorStatus>>,
}

// ============================================================================
// Bridge
// ============================================================================

impl SerialBridge {
    pub fn new(
        settings: SerialSettings,
        ports: Arc<dyn PortEnumerator>,
        opener: Arc<dyn SerialOpener>,
    ) -> Self {
        SerialBridge {
            ports,
            opener,
            subscribers: Arc::new(SubscriberRegistry::new()),
            settings,
            monitor: AsyncMutex::new(None),
            status: Arc::new(Mutex::new(MonitorStatus::default())),
        }
    }

    pub fn status(&self) -> MonitorStatus {
        self.status.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn subscribers(&self) -> Arc<SubscriberRegistry> {
        self.subscribers.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Register a stream client; it gets the connected acknowledgement first
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriberId {
        self.subscribers.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Deliver one serial line to every subscriber present right now
    pub fn publish(&self, line: &str) -> usize {
        self.subscribers.publish(&StreamEvent::serial(line))
    }

    /// Enumerate serial devices
    pub async fn list_ports(&self) -> Result<Vec<SerialPortInfo>, SerialError> {
        let ports = self.ports.clone();
        tokio::task::spawn_blocking(move || ports.list_ports())
            .await
            .map_err(|e| SerialError::Enumerate(format!("enumeration task failed: {}", e)))?
    }

    /// Path of the device the bridge would open
    pub async fn detect_device(&self) -> Result<String, SerialError> {
        let ports = self.list_ports().await?;
        detect_device(&ports, &self.settings.known_vendors)
            .map(|p| p.port_name.clone())
            .ok_or(SerialError::NotFound)
    }

    /// Open the detected device and start streaming its lines.
    ///
    /// Any open connection is closed first, then the bridge waits the reopen
    /// grace period before touching the OS again. Returns the device path.
    pub async fn connect(&self, baud_rate: u32) -> Result<String, SerialError> {
        let mut slot = self.monitor.lock().await;
        self.connect_locked(&mut slot, baud_rate).await
    }

    /// Stop the monitor and release the device. A no-op when already closed.
    pub async fn disconnect(&self) -> Result<DisconnectOutcome, SerialError> {
        let mut slot = self.monitor.lock().await;
        self.disconnect_locked(&mut slot).await
    }

    /// Release the device and keep it released until the returned guard is
    /// dropped or reconnected. Used around firmware uploads.
    pub async fn exclusive(&self) -> ExclusiveAccess<'_> {
        let mut slot = self.monitor.lock().await;
        let was_monitoring = slot.is_some() && self.state() == ConnectionState::Open;
        let baud_rate = self.status().baud_rate;

        if let Err(e) = self.disconnect_locked(&mut slot).await {
            tlog!("[bridge] Releasing device for exclusive use: {}", e);
        }

        ExclusiveAccess {
            bridge: self,
            slot,
            was_monitoring,
            previous_baud: baud_rate,
        }
    }

    /// Disconnect and end every remaining stream so the server can exit
    pub async fn shutdown(&self) {
        if let Err(e) = self.disconnect().await {
            tlog!("[bridge] Shutdown: {}", e);
        }
        let ended = self
            .subscribers
            .close_all(&StreamEvent::disconnected(SERVER_CLOSING_MESSAGE));
        if ended > 0 {
            tlog!("[bridge] Shutdown: ended {} stream(s)", ended);
        }
    }

    fn set_status(&self, state: ConnectionState, device_path: Option<String>, baud: Option<u32>) {
        set_status(&self.status, state, device_path, baud);
    }

    async fn connect_locked(
        &self,
        slot: &mut AsyncMutexGuard<'_, MonitorSlot>,
        baud_rate: u32,
    ) -> Result<String, SerialError> {
        // Zero is B0 ("hang up") to a POSIX tty; refuse before touching the device
        if baud_rate == 0 {
            tlog!("[bridge] Refusing to open at baud rate 0");
            return Err(SerialError::InvalidBaud(baud_rate));
        }

        if slot.is_some() {
            if let Err(e) = self.disconnect_locked(slot).await {
                tlog!("[bridge] Previous connection did not close cleanly: {}", e);
            }
        }

        let grace = self.settings.reopen_grace();
        if !grace.is_zero() {
            tlog!(
                "[bridge] Waiting {}ms for the OS to release the device",
                grace.as_millis()
            );
            tokio::time::sleep(grace).await;
        }

        self.set_status(ConnectionState::Opening, None, None);

        let device_path = match self.detect_device().await {
            Ok(path) => path,
            Err(e) => {
                tlog!("[bridge] No device to open: {}", e);
                self.set_status(ConnectionState::Closed, None, None);
                return Err(e);
            }
        };

        let params = LineParams::from_settings(&self.settings, baud_rate);
        tlog!(
            "[bridge] Opening {} at {}",
            device_path,
            params.describe()
        );

        let opener = self.opener.clone();
        let read_timeout = self.settings.poll_interval();
        let path_for_open = device_path.clone();
        let opened = tokio::task::spawn_blocking(move || {
            opener.open(&path_for_open, &params, read_timeout)
        })
        .await
        .map_err(|e| SerialError::OpenFailed {
            path: device_path.clone(),
            reason: format!("open task failed: {}", e),
        })
        .and_then(|r| r);

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                tlog!("[bridge] {}", e);
                self.set_status(ConnectionState::Closed, None, None);
                return Err(e);
            }
        };

        // Open before the loop starts so a failing loop's Closed is final
        self.set_status(
            ConnectionState::Open,
            Some(device_path.clone()),
            Some(baud_rate),
        );

        let cancel_flag = Arc::new(AtomicBool::new(false));
        let worker = MonitorWorker {
            device_path: device_path.clone(),
            cancel_flag: cancel_flag.clone(),
            subscribers: self.subscribers.clone(),
            status: self.status.clone(),
        };
        let task = tokio::task::spawn_blocking(move || worker.run(link));

        **slot = Some(ActiveMonitor {
            device_path: device_path.clone(),
            cancel_flag,
            task,
        });

        tlog!("[bridge] Serial monitor active on {}", device_path);
        Ok(device_path)
    }

    async fn disconnect_locked(
        &self,
        slot: &mut AsyncMutexGuard<'_, MonitorSlot>,
    ) -> Result<DisconnectOutcome, SerialError> {
        let Some(active) = slot.take() else {
            tlog!("[bridge] Disconnect requested, monitor already inactive");
            return Ok(DisconnectOutcome::AlreadyInactive);
        };

        // The loop may have died on a read error; it already cleaned up
        let loop_alive = self.state() == ConnectionState::Open;
        if loop_alive {
            self.set_status(
                ConnectionState::Closing,
                Some(active.device_path.clone()),
                self.status().baud_rate,
            );
        }

        active.cancel_flag.store(true, Ordering::SeqCst);

        if loop_alive {
            let notified = self
                .subscribers
                .close_all(&StreamEvent::disconnected(SERVER_CLOSING_MESSAGE));
            tlog!("[bridge] Notified {} stream client(s) of disconnect", notified);
        }

        let result = match active.task.await {
            Ok(MonitorExit::Stopped(Ok(()))) => {
                tlog!("[bridge] Closed {}", active.device_path);
                Ok(DisconnectOutcome::Closed)
            }
            Ok(MonitorExit::Stopped(Err(e))) => {
                tlog!("[bridge] Error closing {}: {}", active.device_path, e);
                Err(e)
            }
            Ok(MonitorExit::Failed) => Ok(DisconnectOutcome::AlreadyInactive),
            Err(e) => Err(SerialError::CloseError(format!("monitor task failed: {}", e))),
        };

        self.set_status(ConnectionState::Closed, None, None);
        result
    }
}

fn set_status(
    status: &Mutex<MonitorStatus>,
    state: ConnectionState,
    device_path: Option<String>,
    baud_rate: Option<u32>,
) {
    if let Ok(mut s) = status.lock() {
        *s = MonitorStatus {
            state,
            device_path,
            baud_rate,
        };
    }
}

// ============================================================================
// Read loop
// ============================================================================

struct MonitorWorker {
    device_path: String,
    cancel_flag: Arc<AtomicBool>,
    subscribers: Arc<SubscriberRegistry>,
    status: Arc<Mutex<MonitorStatus>>,
}

impl MonitorWorker {
    /// Blocking read loop; runs until cancelled or the device fails
    fn run(self, mut link: Box<dyn SerialLink>) -> MonitorExit {
        let mut framer = LineFramer::default();
        let mut buf = [0u8; 256];

        let failure = 'read: loop {
            if self.cancel_flag.load(Ordering::SeqCst) {
                break None;
            }

            match link.read(&mut buf) {
                Ok(0) => break Some(SerialError::ReadError("device disconnected".to_string())),
                Ok(n) => {
                    for line in framer.feed(&buf[..n]) {
                        tlog!("[serial:{}] {}", self.device_path, line);
                        let event = StreamEvent::serial(line);
                        if self
                            .subscribers
                            .publish_unless(&event, &self.cancel_flag)
                            .is_none()
                        {
                            break 'read None;
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => break Some(SerialError::ReadError(e.to_string())),
            }
        };

        match failure {
            None => MonitorExit::Stopped(link.close()),
            Some(err) => {
                tlog!("[bridge] {} on {}", err, self.device_path);
                if let Err(e) = link.close() {
                    tlog!("[bridge] {}", e);
                }
                if !self.cancel_flag.load(Ordering::SeqCst) {
                    // A last line the device never terminated
                    if let Some(line) = framer.flush() {
                        self.subscribers
                            .publish_unless(&StreamEvent::serial(line), &self.cancel_flag);
                    }
                    self.subscribers.close_all(&StreamEvent::disconnected(format!(
                        "Serial port error: {}",
                        err
                    )));
                    set_status(&self.status, ConnectionState::Closed, None, None);
                }
                MonitorExit::Failed
            }
        }
    }
}

// ============================================================================
// Exclusive access
// ============================================================================

/// Holds the device released. No connect or disconnect can run while it
/// lives; dropping it simply leaves the monitor Closed.
pub struct ExclusiveAccess<'a> {
    bridge: &'a SerialBridge,
    slot: AsyncMutexGuard<'a, MonitorSlot>,
    was_monitoring: bool,
    previous_baud: Option<u32>,
}

impl<'a> ExclusiveAccess<'a> {
    /// Whether the monitor was streaming when access was taken
    pub fn was_monitoring(&self) -> bool {
        self.was_monitoring
    }

    /// Baud rate of the connection that was released, if any
    pub fn previous_baud(&self) -> Option<u32> {
        self.previous_baud
    }

    /// Give the device back to the monitor, opening it at `baud_rate`
    pub async fn reconnect(mut self, baud_rate: u32) -> Result<String, SerialError> {
        self.bridge.connect_locked(&mut self.slot, baud_rate).await
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::StreamEventKind;
    use crate::fanout::{ChannelSubscriber, SubscriberWriteError};
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use uuid::Uuid;

    // ------------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------------

    struct FakePorts {
        ports: Mutex<Vec<SerialPortInfo>>,
    }

    impl FakePorts {
        fn with(ports: Vec<SerialPortInfo>) -> Arc<Self> {
            Arc::new(FakePorts {
                ports: Mutex::new(ports),
            })
        }
    }

    impl PortEnumerator for FakePorts {
        fn list_ports(&self) -> Result<Vec<SerialPortInfo>, SerialError> {
            Ok(self.ports.lock().unwrap().clone())
        }
    }

    type Script = Arc<Mutex<VecDeque<std::io::Result<Vec<u8>>>>>;

    /// Opens links that replay a shared script and tracks live handles
    #[derive(Default)]
    struct FakeOpener {
        script: Script,
        live: Arc<AtomicUsize>,
        max_live: Arc<AtomicUsize>,
        opens: AtomicUsize,
        fail_open: Mutex<Option<String>>,
        fail_close: Arc<AtomicBool>,
        opened_at: Mutex<Vec<(String, u32)>>,
        /// When set, an idle link produces a line every millisecond
        chatter: Arc<AtomicBool>,
    }

    impl FakeOpener {
        fn push_bytes(&self, bytes: &[u8]) {
            self.script.lock().unwrap().push_back(Ok(bytes.to_vec()));
        }

        fn push_error(&self, kind: std::io::ErrorKind) {
            self.script
                .lock()
                .unwrap()
                .push_back(Err(std::io::Error::new(kind, "scripted failure")));
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }
    }

    struct FakeLink {
        script: Script,
        live: Arc<AtomicUsize>,
        fail_close: Arc<AtomicBool>,
        chatter: Arc<AtomicBool>,
        timeout: Duration,
    }

    impl SerialOpener for FakeOpener {
        fn open(
            &self,
            path: &str,
            params: &LineParams,
            read_timeout: Duration,
        ) -> Result<Box<dyn SerialLink>, SerialError> {
            if let Some(reason) = self.fail_open.lock().unwrap().clone() {
                return Err(SerialError::OpenFailed {
                    path: path.to_string(),
                    reason,
                });
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            let now = self.live.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_live.fetch_max(now, Ordering::SeqCst);
            self.opened_at
                .lock()
                .unwrap()
                .push((path.to_string(), params.baud_rate));
            Ok(Box::new(FakeLink {
                script: self.script.clone(),
                live: self.live.clone(),
                fail_close: self.fail_close.clone(),
                chatter: self.chatter.clone(),
                timeout: read_timeout,
            }))
        }
    }

    impl SerialLink for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(bytes)) => {
                    let n = bytes.len().min(buf.len());
                    buf[..n].copy_from_slice(&bytes[..n]);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None if self.chatter.load(Ordering::SeqCst) => {
                    std::thread::sleep(Duration::from_millis(1));
                    let line = b"tick\n";
                    buf[..line.len()].copy_from_slice(line);
                    Ok(line.len())
                }
                None => {
                    std::thread::sleep(self.timeout);
                    Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "idle"))
                }
            }
        }

        fn close(self: Box<Self>) -> Result<(), SerialError> {
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(SerialError::CloseError("scripted close failure".to_string()));
            }
            Ok(())
        }
    }

    impl Drop for FakeLink {
        fn drop(&mut self) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Subscriber that records events, optionally failing
    struct Recorder {
        id: SubscriberId,
        events: Mutex<Vec<StreamEvent>>,
        closed: AtomicBool,
        fail: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Recorder {
                id: Uuid::new_v4(),
                events: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                fail: AtomicBool::new(false),
            })
        }

        fn lines(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter(|e| e.kind == StreamEventKind::Serial)
                .map(|e| e.message.clone())
                .collect()
        }

        fn last(&self) -> Option<StreamEvent> {
            self.events.lock().unwrap().last().cloned()
        }

        fn all(&self) -> Vec<StreamEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Subscriber for Recorder {
        fn id(&self) -> SubscriberId {
            self.id
        }

        fn send(&self, event: &StreamEvent) -> Result<(), SubscriberWriteError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SubscriberWriteError::Closed);
            }
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn fast_settings() -> SerialSettings {
        SerialSettings {
            reopen_grace_ms: 0,
            poll_interval_ms: 5,
            ..SerialSettings::default()
        }
    }

    fn bridge_with(ports: Vec<SerialPortInfo>) -> (SerialBridge, Arc<FakeOpener>) {
        let opener = Arc::new(FakeOpener::default());
        let bridge = SerialBridge::new(fast_settings(), FakePorts::with(ports), opener.clone());
        (bridge, opener)
    }

    fn one_ftdi() -> Vec<SerialPortInfo> {
        vec![SerialPortInfo::usb("/dev/ttyUSB0", Some("FTDI"))]
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    // ------------------------------------------------------------------------
    // Connect / disconnect
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_connect_opens_detected_device() {
        let (bridge, opener) = bridge_with(vec![
            SerialPortInfo::usb("/dev/ttyS0", Some("Intel")),
            SerialPortInfo::usb("/dev/ttyUSB1", Some("FTDI")),
        ]);

        let path = bridge.connect(9600).await.expect("connect");
        assert_eq!(path, "/dev/ttyUSB1");
        assert_eq!(bridge.state(), ConnectionState::Open);
        assert_eq!(
            bridge.status().device_path.as_deref(),
            Some("/dev/ttyUSB1")
        );
        assert_eq!(bridge.status().baud_rate, Some(9600));
        assert_eq!(opener.live(), 1);

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_connect_without_device() {
        let (bridge, opener) = bridge_with(vec![]);
        assert_eq!(bridge.connect(9600).await, Err(SerialError::NotFound));
        assert_eq!(bridge.state(), ConnectionState::Closed);
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_connect_rejects_zero_baud() {
        let (bridge, opener) = bridge_with(one_ftdi());
        assert_eq!(bridge.connect(0).await, Err(SerialError::InvalidBaud(0)));
        assert_eq!(bridge.state(), ConnectionState::Closed);
        assert!(opener.opened_at.lock().unwrap().is_empty());

        // An open monitor is left alone by the refused request
        bridge.connect(9600).await.expect("connect");
        assert_eq!(bridge.connect(0).await, Err(SerialError::InvalidBaud(0)));
        assert_eq!(bridge.state(), ConnectionState::Open);
        assert_eq!(opener.live(), 1);
        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_connect_open_failure_stays_closed() {
        let (bridge, opener) = bridge_with(one_ftdi());
        *opener.fail_open.lock().unwrap() = Some("Device or resource busy".to_string());

        let err = bridge.connect(9600).await.unwrap_err();
        assert!(matches!(err, SerialError::OpenFailed { ref path, .. } if path == "/dev/ttyUSB0"));
        assert_eq!(bridge.state(), ConnectionState::Closed);
        assert_eq!(opener.live(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_when_closed_is_noop() {
        let (bridge, _opener) = bridge_with(one_ftdi());
        let sub = Recorder::new();
        bridge.subscribe(sub.clone());

        assert_eq!(
            bridge.disconnect().await,
            Ok(DisconnectOutcome::AlreadyInactive)
        );
        assert_eq!(
            bridge.disconnect().await,
            Ok(DisconnectOutcome::AlreadyInactive)
        );
        assert_eq!(bridge.subscriber_count(), 1);
        assert!(!sub.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_notifies_and_clears_subscribers() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");

        let subs: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
        for sub in &subs {
            bridge.subscribe(sub.clone());
        }

        assert_eq!(bridge.disconnect().await, Ok(DisconnectOutcome::Closed));
        assert_eq!(bridge.subscriber_count(), 0);
        assert_eq!(bridge.state(), ConnectionState::Closed);
        assert_eq!(opener.live(), 0);
        for sub in &subs {
            let last = sub.last().expect("event");
            assert_eq!(last.kind, StreamEventKind::Disconnected);
            assert_eq!(last.message, SERVER_CLOSING_MESSAGE);
            assert!(sub.closed.load(Ordering::SeqCst));
        }

        // A client arriving after the stop only gets its acknowledgement
        let late = Recorder::new();
        bridge.subscribe(late.clone());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(late.all(), vec![StreamEvent::connected()]);
        assert!(!late.closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_disconnect_under_live_traffic() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");

        let subs: Vec<_> = (0..3).map(|_| Recorder::new()).collect();
        for sub in &subs {
            bridge.subscribe(sub.clone());
        }
        opener.chatter.store(true, Ordering::SeqCst);
        wait_for(|| subs.iter().all(|s| s.lines().len() >= 5)).await;

        let started = Instant::now();
        assert_eq!(bridge.disconnect().await, Ok(DisconnectOutcome::Closed));
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(opener.live(), 0);

        for sub in &subs {
            let events = sub.all();
            let stops: Vec<_> = events
                .iter()
                .filter(|e| e.kind == StreamEventKind::Disconnected)
                .collect();
            assert_eq!(stops.len(), 1);
            assert_eq!(events.last().map(|e| e.kind), Some(StreamEventKind::Disconnected));
            assert!(events.iter().all(|e| e.kind != StreamEventKind::Serial || e.message == "tick"));
        }

        // The device is still chattering, but nothing reaches a new client
        let late = Recorder::new();
        bridge.subscribe(late.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(late.lines().is_empty());
        assert_eq!(late.all(), vec![StreamEvent::connected()]);
    }

    #[tokio::test]
    async fn test_close_error_still_marks_closed() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");
        opener.fail_close.store(true, Ordering::SeqCst);

        let err = bridge.disconnect().await.unwrap_err();
        assert!(matches!(err, SerialError::CloseError(_)));
        assert_eq!(bridge.state(), ConnectionState::Closed);
        assert_eq!(opener.live(), 0);
    }

    #[tokio::test]
    async fn test_disconnect_returns_within_poll_bound() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");

        let started = Instant::now();
        bridge.disconnect().await.expect("disconnect");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(opener.live(), 0);
    }

    // ------------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_lines_reach_subscribers_in_order() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let sub = Recorder::new();
        bridge.subscribe(sub.clone());
        bridge.connect(9600).await.expect("connect");

        opener.push_bytes(b"temp=21\r\nhum");
        opener.push_bytes(b"=40\r\n\r\nok\n");

        wait_for(|| sub.lines().len() == 3).await;
        assert_eq!(sub.lines(), vec!["temp=21", "hum=40", "ok"]);

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_publish_hello_reaches_all() {
        let (bridge, _opener) = bridge_with(one_ftdi());
        let a = Recorder::new();
        let b = Recorder::new();
        bridge.subscribe(a.clone());
        bridge.subscribe(b.clone());

        assert_eq!(bridge.publish("hello"), 2);
        let expected = StreamEvent::serial("hello");
        assert_eq!(a.last(), Some(expected.clone()));
        assert_eq!(b.last(), Some(expected));
    }

    #[tokio::test]
    async fn test_unsubscribed_client_gets_nothing_more() {
        let (bridge, _opener) = bridge_with(one_ftdi());
        let sub = Recorder::new();
        let id = bridge.subscribe(sub.clone());
        bridge.publish("before");
        assert!(bridge.unsubscribe(id));
        assert!(!bridge.unsubscribe(id));
        bridge.publish("after");
        assert_eq!(sub.lines(), vec!["before"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_isolated() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let good = Recorder::new();
        let bad = Recorder::new();
        bridge.subscribe(good.clone());
        bridge.subscribe(bad.clone());
        bad.fail.store(true, Ordering::SeqCst);

        bridge.connect(9600).await.expect("connect");
        opener.push_bytes(b"a\nb\nc\n");

        wait_for(|| good.lines().len() == 3).await;
        assert_eq!(good.lines(), vec!["a", "b", "c"]);
        assert_eq!(bridge.subscriber_count(), 1);

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_nothing_delivered_after_disconnect() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");
        bridge.disconnect().await.expect("disconnect");

        let late = Recorder::new();
        bridge.subscribe(late.clone());
        opener.push_bytes(b"ghost\n");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(late.lines().is_empty());
    }

    #[tokio::test]
    async fn test_read_error_closes_connection() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let sub = Recorder::new();
        bridge.subscribe(sub.clone());
        bridge.connect(9600).await.expect("connect");

        opener.push_bytes(b"last words\nunterminated");
        opener.push_error(std::io::ErrorKind::BrokenPipe);

        wait_for(|| bridge.state() == ConnectionState::Closed).await;
        assert_eq!(opener.live(), 0);
        assert_eq!(sub.lines(), vec!["last words", "unterminated"]);
        assert_eq!(
            sub.last().map(|e| e.kind),
            Some(StreamEventKind::Disconnected)
        );
        assert_eq!(bridge.subscriber_count(), 0);

        // Already closed: a later disconnect is a quiet no-op
        assert_eq!(
            bridge.disconnect().await,
            Ok(DisconnectOutcome::AlreadyInactive)
        );
    }

    #[tokio::test]
    async fn test_channel_subscriber_receives_stream() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let (sub, mut rx) = ChannelSubscriber::new(16);
        bridge.subscribe(sub);
        bridge.connect(115200).await.expect("connect");
        opener.push_bytes(b"hello\n");

        let ack = rx.recv().await.expect("ack");
        assert_eq!(ack, StreamEvent::connected());
        let line = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("line in time")
            .expect("line");
        assert_eq!(line, StreamEvent::serial("hello"));

        bridge.disconnect().await.expect("disconnect");
        let bye = rx.recv().await.expect("goodbye");
        assert_eq!(bye.kind, StreamEventKind::Disconnected);
        assert!(rx.recv().await.is_none());
    }

    // ------------------------------------------------------------------------
    // Reconnect and mutual exclusion
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_reconnect_closes_before_reopening() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("first");
        bridge.connect(115200).await.expect("second");

        assert_eq!(opener.opens.load(Ordering::SeqCst), 2);
        assert_eq!(opener.max_live.load(Ordering::SeqCst), 1);
        assert_eq!(opener.live(), 1);
        assert_eq!(bridge.status().baud_rate, Some(115200));
        assert_eq!(
            *opener.opened_at.lock().unwrap(),
            vec![
                ("/dev/ttyUSB0".to_string(), 9600),
                ("/dev/ttyUSB0".to_string(), 115200)
            ]
        );

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_reconnect_waits_grace_period() {
        let opener = Arc::new(FakeOpener::default());
        let settings = SerialSettings {
            reopen_grace_ms: 60,
            ..fast_settings()
        };
        let bridge = SerialBridge::new(settings, FakePorts::with(one_ftdi()), opener.clone());

        bridge.connect(9600).await.expect("first");
        let started = Instant::now();
        bridge.connect(9600).await.expect("second");
        assert!(started.elapsed() >= Duration::from_millis(60));

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_concurrent_connects_never_overlap_handles() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let bridge = Arc::new(bridge);

        let mut tasks = Vec::new();
        for i in 0..6 {
            let bridge = bridge.clone();
            tasks.push(tokio::spawn(async move {
                if i % 3 == 2 {
                    bridge.disconnect().await.map(|_| String::new())
                } else {
                    bridge.connect(9600).await
                }
            }));
        }
        for task in tasks {
            let _ = task.await.expect("join");
        }

        assert_eq!(opener.max_live.load(Ordering::SeqCst), 1);
        assert!(opener.live() <= 1);
        bridge.disconnect().await.expect("disconnect");
        assert_eq!(opener.live(), 0);
    }

    #[tokio::test]
    async fn test_exclusive_releases_and_reconnects() {
        let (bridge, opener) = bridge_with(one_ftdi());
        bridge.connect(9600).await.expect("connect");

        let access = bridge.exclusive().await;
        assert!(access.was_monitoring());
        assert_eq!(access.previous_baud(), Some(9600));
        assert_eq!(opener.live(), 0);
        assert_eq!(bridge.state(), ConnectionState::Closed);

        let path = access.reconnect(115200).await.expect("reconnect");
        assert_eq!(path, "/dev/ttyUSB0");
        assert_eq!(opener.live(), 1);
        assert_eq!(bridge.status().baud_rate, Some(115200));

        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_exclusive_blocks_connect_until_dropped() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let bridge = Arc::new(bridge);

        let access = bridge.exclusive().await;
        assert!(!access.was_monitoring());

        let contender = {
            let bridge = bridge.clone();
            tokio::spawn(async move { bridge.connect(9600).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(opener.opens.load(Ordering::SeqCst), 0);

        drop(access);
        contender.await.expect("join").expect("connect");
        assert_eq!(opener.live(), 1);
        bridge.disconnect().await.expect("disconnect");
    }

    #[tokio::test]
    async fn test_shutdown_ends_all_streams() {
        let (bridge, opener) = bridge_with(one_ftdi());
        let idle = Recorder::new();
        bridge.subscribe(idle.clone());

        bridge.shutdown().await;
        assert!(idle.closed.load(Ordering::SeqCst));
        assert_eq!(bridge.subscriber_count(), 0);
        assert_eq!(opener.live(), 0);
    }
}
