// SPDX-License-Identifier: GPL-2.0-or-later

mod dns;
mod service;

pub use service::{
    CONTROL_SERVICE_TYPE, DEFAULT_WEBSOCKET_PATH, DeviceService, IncompleteService, IpPreference,
    RTSP_SERVICE_TYPE,
};

use common::{ArcLogger, LogEntry, LogLevel};
use dns::{Question, Record, RecordData, TYPE_A, TYPE_AAAA, TYPE_PTR, TYPE_SRV, TYPE_TXT};
use std::{
    collections::HashMap,
    net::{Ipv4Addr, Ipv6Addr},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use thiserror::Error;
use tokio::{net::UdpSocket, sync::mpsc, time::Instant};
use tokio_util::sync::CancellationToken;

const MDNS_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 251);
const MDNS_PORT: u16 = 5353;

/// Default time to wait for a service lookup.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

// How long a discovered instance may stay incomplete before its
// Added event is suppressed.
const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

// Missing records are re-queried at this pace while resolving.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

// Fallback lifetime when a PTR record carries no usable TTL.
const DEFAULT_TTL: Duration = Duration::from_secs(120);

const TICK: Duration = Duration::from_millis(250);
const BROWSE_INTERVAL: Duration = Duration::from_secs(25);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceEventKind {
    Added,
    Updated,
    Removed,
}

pub type ServiceEvent = (ServiceEventKind, DeviceService);

#[derive(Debug, Error)]
pub enum ListenError {
    #[error("bind multicast socket: {0}")]
    Bind(std::io::Error),
}

#[derive(Debug, Error)]
pub enum RequestServiceError {
    #[error("bind socket: {0}")]
    Bind(std::io::Error),

    /// No response within the timeout.
    #[error("service not found")]
    ServiceNotFound,
}

#[derive(Debug, Error)]
pub enum WaitForServiceError {
    #[error("no matching service appeared within the timeout")]
    Timeout,

    #[error("the discovery event stream ended")]
    Closed,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Continuous service discovery. Owns a browse task that keeps the
/// service map current and publishes add/update/remove events.
pub struct Discovery {
    services: Arc<Mutex<HashMap<String, DeviceService>>>,
    events: mpsc::UnboundedReceiver<ServiceEvent>,
    token: CancellationToken,
}

impl Discovery {
    /// Starts browsing for devices on the local network.
    pub fn listen(logger: ArcLogger) -> Result<Self, ListenError> {
        let socket = bind_multicast().map_err(ListenError::Bind)?;

        let services = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        let browser = Browser::new(services.clone(), events_tx, logger, false);
        tokio::spawn(run_browser(socket, browser, token.clone()));

        Ok(Self {
            services,
            events,
            token,
        })
    }

    /// Snapshot of the currently known services, keyed by hostname.
    #[must_use]
    pub fn services(&self) -> HashMap<String, DeviceService> {
        lock(&self.services).clone()
    }

    /// The queue of service events. Events are delivered in the order
    /// the network reports them; an `Added` or `Updated` event is only
    /// published after the service record was fully populated.
    pub fn events(&mut self) -> &mut mpsc::UnboundedReceiver<ServiceEvent> {
        &mut self.events
    }

    /// The next service event.
    pub async fn next_event(&mut self) -> Option<ServiceEvent> {
        self.events.recv().await
    }

    /// Consumes events until a service matching `preference` appears.
    pub async fn wait_for_single_service(
        &mut self,
        timeout: Duration,
        preference: IpPreference,
    ) -> Result<DeviceService, WaitForServiceError> {
        wait_for_single_service(&mut self.events, timeout, preference).await
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Consumes events from `events` until an added or updated service
/// matches the address preference.
pub async fn wait_for_single_service(
    events: &mut mpsc::UnboundedReceiver<ServiceEvent>,
    timeout: Duration,
    preference: IpPreference,
) -> Result<DeviceService, WaitForServiceError> {
    let deadline = Instant::now() + timeout;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .map_err(|_| WaitForServiceError::Timeout)?;
        let Some((kind, service)) = event else {
            return Err(WaitForServiceError::Closed);
        };
        match kind {
            ServiceEventKind::Added | ServiceEventKind::Updated => {
                if service.has_address(preference) {
                    return Ok(service);
                }
            }
            ServiceEventKind::Removed => {}
        }
    }
}

/// One-shot lookup of a single device by hostname.
pub async fn request_service(
    hostname: &str,
    timeout: Duration,
    logger: ArcLogger,
) -> Result<DeviceService, RequestServiceError> {
    let socket = bind_oneshot().map_err(RequestServiceError::Bind)?;

    let services = Arc::new(Mutex::new(HashMap::new()));
    let (events_tx, mut events) = mpsc::unbounded_channel();
    let mut browser = Browser::new(services, events_tx, logger, true);

    let deadline = Instant::now() + timeout;
    let instance = format!("{hostname}.{CONTROL_SERVICE_TYPE}");
    browser.track(&instance, deadline, deadline + DEFAULT_TTL);

    let mut buf = vec![0; 9000];
    let mut next_retry = Instant::now();
    loop {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if now >= next_retry {
            send_questions(&socket, browser.tick(now)).await;
            next_retry = now + RETRY_INTERVAL;
        }

        let wakeup = next_retry.min(deadline);
        tokio::select! {
            () = tokio::time::sleep_until(wakeup) => {}
            res = socket.recv_from(&mut buf) => {
                let Ok((n, _)) = res else {
                    continue;
                };
                if let Ok(records) = dns::parse_response(&buf[..n]) {
                    send_questions(&socket, browser.handle_records(records, Instant::now())).await;
                }
            }
        }

        if let Ok((ServiceEventKind::Added, service)) = events.try_recv() {
            return Ok(service);
        }
    }

    // Past the deadline an incompletely paired service is still
    // published if its control half resolved.
    browser.tick(deadline + TICK);
    match events.try_recv() {
        Ok((ServiceEventKind::Added, service)) => Ok(service),
        _ => Err(RequestServiceError::ServiceNotFound),
    }
}

fn bind_multicast() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.bind(&std::net::SocketAddr::from((Ipv4Addr::UNSPECIFIED, MDNS_PORT)).into())?;
    socket.join_multicast_v4(&MDNS_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn bind_oneshot() -> std::io::Result<UdpSocket> {
    use socket2::{Domain, Protocol, Socket, Type};

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&std::net::SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)).into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn run_browser(socket: UdpSocket, mut browser: Browser, token: CancellationToken) {
    let mut buf = vec![0; 9000];
    let mut tick = tokio::time::interval(TICK);
    let mut browse = tokio::time::interval(BROWSE_INTERVAL);

    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = browse.tick() => {
                let query = dns::build_query(&[Question {
                    name: CONTROL_SERVICE_TYPE.to_owned(),
                    qtype: TYPE_PTR,
                    unicast_response: false,
                }]);
                _ = socket.send_to(&query, (MDNS_GROUP, MDNS_PORT)).await;
            }
            _ = tick.tick() => {
                send_questions(&socket, browser.tick(Instant::now())).await;
            }
            res = socket.recv_from(&mut buf) => {
                let Ok((n, _)) = res else {
                    continue;
                };
                match dns::parse_response(&buf[..n]) {
                    Ok(records) if !records.is_empty() => {
                        let questions = browser.handle_records(records, Instant::now());
                        send_questions(&socket, questions).await;
                    }
                    Ok(_) => {}
                    Err(e) => browser.log(LogLevel::Debug, &format!("bad mdns message: {e}")),
                }
            }
        }
    }
}

async fn send_questions(socket: &UdpSocket, questions: Vec<Question>) {
    if questions.is_empty() {
        return;
    }
    let query = dns::build_query(&questions);
    _ = socket.send_to(&query, (MDNS_GROUP, MDNS_PORT)).await;
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct InstanceRecords {
    // Original-case instance name as first seen on the wire.
    display: String,
    port: Option<u16>,
    target: Option<String>,
    txt: Option<HashMap<String, String>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
struct HostRecords {
    v4: Option<Ipv4Addr>,
    v6: Option<Ipv6Addr>,
}

#[derive(Default)]
struct Cache {
    // Keyed by lowercased names.
    instances: HashMap<String, InstanceRecords>,
    hosts: HashMap<String, HostRecords>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum TrackedState {
    Resolving { deadline: Instant },
    Published,
}

struct Tracked {
    state: TrackedState,
    expires: Instant,
    last_query: Option<Instant>,
}

/// The socket-free core of the browse task. Applies parsed records to
/// a record cache, decides when a service is complete enough to
/// publish, and reports which records are still missing.
struct Browser {
    cache: Cache,
    tracked: HashMap<String, Tracked>,
    services: Arc<Mutex<HashMap<String, DeviceService>>>,
    events_tx: mpsc::UnboundedSender<ServiceEvent>,
    logger: ArcLogger,

    // One-shot lookups want unicast responses.
    unicast: bool,
}

impl Browser {
    fn new(
        services: Arc<Mutex<HashMap<String, DeviceService>>>,
        events_tx: mpsc::UnboundedSender<ServiceEvent>,
        logger: ArcLogger,
        unicast: bool,
    ) -> Self {
        Self {
            cache: Cache::default(),
            tracked: HashMap::new(),
            services,
            events_tx,
            logger,
            unicast,
        }
    }

    fn log(&self, level: LogLevel, msg: &str) {
        self.logger
            .log(LogEntry::new(level, "discovery", None, msg.to_owned()));
    }

    /// Starts resolving `instance` with an explicit deadline.
    fn track(&mut self, instance: &str, deadline: Instant, expires: Instant) {
        let key = instance.to_ascii_lowercase();
        self.instance_entry(instance);
        self.tracked.entry(key).or_insert(Tracked {
            state: TrackedState::Resolving { deadline },
            expires,
            last_query: None,
        });
    }

    fn handle_records(&mut self, records: Vec<Record>, now: Instant) -> Vec<Question> {
        for record in &records {
            self.apply(record, now);
        }
        self.evaluate(now)
    }

    fn tick(&mut self, now: Instant) -> Vec<Question> {
        self.evaluate(now)
    }

    fn apply(&mut self, record: &Record, now: Instant) {
        let name = record.name.to_ascii_lowercase();
        match &record.data {
            RecordData::Ptr(instance) => {
                if name != CONTROL_SERVICE_TYPE {
                    return;
                }
                let key = instance.to_ascii_lowercase();
                if record.ttl == 0 {
                    self.goodbye(&key);
                    return;
                }
                let expires = now + Duration::from_secs(u64::from(record.ttl).max(1));
                match self.tracked.get_mut(&key) {
                    Some(tracked) => tracked.expires = expires,
                    None => self.track(instance, now + RESOLVE_TIMEOUT, expires),
                }
            }
            RecordData::Srv { port, target } => {
                if !is_service_instance(&name) {
                    return;
                }
                let entry = self.instance_entry(&record.name);
                entry.port = Some(*port);
                entry.target = Some(target.to_ascii_lowercase());
                self.implicit_track(&record.name, &name, now);
            }
            RecordData::Txt(entries) => {
                if !is_service_instance(&name) {
                    return;
                }
                let txt = entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone().unwrap_or_default()))
                    .collect();
                self.instance_entry(&record.name).txt = Some(txt);
                self.implicit_track(&record.name, &name, now);
            }
            RecordData::A(ip) => {
                self.cache.hosts.entry(name).or_default().v4 = Some(*ip);
            }
            RecordData::Aaaa(ip) => {
                self.cache.hosts.entry(name).or_default().v6 = Some(*ip);
            }
            RecordData::Unsupported => {}
        }
    }

    fn instance_entry(&mut self, display: &str) -> &mut InstanceRecords {
        let entry = self
            .cache
            .instances
            .entry(display.to_ascii_lowercase())
            .or_default();
        if entry.display.is_empty() {
            entry.display = display.to_owned();
        }
        entry
    }

    // A control-type SRV or TXT record may arrive without its PTR.
    fn implicit_track(&mut self, display: &str, key: &str, now: Instant) {
        if key.ends_with(CONTROL_SERVICE_TYPE) && !self.tracked.contains_key(key) {
            self.track(display, now + RESOLVE_TIMEOUT, now + DEFAULT_TTL);
        }
    }

    fn goodbye(&mut self, key: &str) {
        let Some(tracked) = self.tracked.remove(key) else {
            return;
        };
        self.remove_published(key, tracked.state);
    }

    fn remove_published(&mut self, key: &str, state: TrackedState) {
        // The service map is keyed by the original-case hostname.
        let hostname = self
            .cache
            .instances
            .get(key)
            .map_or_else(|| hostname_of(key), |i| hostname_of(&i.display));
        self.cache.instances.remove(key);
        self.cache.instances.remove(&rtsp_key(key));
        if state == TrackedState::Published {
            let removed = lock(&self.services).remove(&hostname);
            if let Some(service) = removed {
                _ = self.events_tx.send((ServiceEventKind::Removed, service));
            }
        }
    }

    /// Re-evaluates every tracked instance. Publishes services that
    /// became complete and returns the questions for records that are
    /// still missing.
    fn evaluate(&mut self, now: Instant) -> Vec<Question> {
        let mut questions = Vec::new();
        let keys: Vec<String> = self.tracked.keys().cloned().collect();

        for key in keys {
            let Some(tracked) = self.tracked.get(&key) else {
                continue;
            };

            if now >= tracked.expires {
                let state = tracked.state;
                self.tracked.remove(&key);
                self.remove_published(&key, state);
                continue;
            }

            match tracked.state {
                TrackedState::Resolving { deadline } => {
                    let service = self.build_service(&key);
                    let rtsp_complete =
                        service.as_ref().is_some_and(|s| s.rtsp_port.is_some());

                    if rtsp_complete || (now >= deadline && service.is_some()) {
                        let Some(service) = service else {
                            continue;
                        };
                        #[allow(clippy::unwrap_used)]
                        let tracked = self.tracked.get_mut(&key).unwrap();
                        tracked.state = TrackedState::Published;
                        lock(&self.services).insert(service.hostname.clone(), service.clone());
                        _ = self.events_tx.send((ServiceEventKind::Added, service));
                    } else if now >= deadline {
                        // Details never arrived, suppress the event.
                        self.log(LogLevel::Debug, &format!("detail fetch failed for {key}"));
                        self.tracked.remove(&key);
                        self.cache.instances.remove(&key);
                    } else {
                        let due = self
                            .tracked
                            .get(&key)
                            .is_some_and(|t| {
                                t.last_query.map_or(true, |last| now >= last + RETRY_INTERVAL)
                            });
                        if due {
                            if let Some(tracked) = self.tracked.get_mut(&key) {
                                tracked.last_query = Some(now);
                            }
                            questions.extend(self.missing_questions(&key));
                        }
                    }
                }
                TrackedState::Published => {
                    let Some(service) = self.build_service(&key) else {
                        // Incomplete rebuild leaves the old record in place.
                        continue;
                    };
                    let mut services = lock(&self.services);
                    if services.get(&service.hostname) != Some(&service) {
                        services.insert(service.hostname.clone(), service.clone());
                        drop(services);
                        _ = self.events_tx.send((ServiceEventKind::Updated, service));
                    }
                }
            }
        }
        questions
    }

    fn build_service(&self, key: &str) -> Option<DeviceService> {
        let instance = self.cache.instances.get(key)?;
        let port = instance.port?;
        let target = instance.target.clone()?;
        let host = self.cache.hosts.get(&target)?;
        if host.v4.is_none() && host.v6.is_none() {
            return None;
        }

        let hostname = hostname_of(&instance.display);

        let mut service = DeviceService {
            hostname,
            service_type: CONTROL_SERVICE_TYPE.to_owned(),
            server: target,
            ipv4: host.v4,
            ipv6: host.v6,
            port,
            rtsp_port: None,
            rtsp_live_path: None,
            rtsp_recordings_path: None,
        };

        // The paired RTSP service is optional.
        if let Some(rtsp) = self.cache.instances.get(&rtsp_key(key)) {
            if let (Some(port), Some(txt)) = (rtsp.port, &rtsp.txt) {
                service.rtsp_port = Some(port);
                service.rtsp_live_path = txt.get("path").cloned();
                service.rtsp_recordings_path = txt.get("recordings").cloned();
            }
        }
        Some(service)
    }

    fn missing_questions(&self, key: &str) -> Vec<Question> {
        let mut questions = Vec::new();
        let mut want = |name: &str, qtype| {
            questions.push(Question {
                name: name.to_owned(),
                qtype,
                unicast_response: self.unicast,
            });
        };

        let instance = self.cache.instances.get(key);
        match instance {
            None => {
                want(key, TYPE_SRV);
                want(key, TYPE_TXT);
            }
            Some(instance) => {
                if instance.port.is_none() {
                    want(key, TYPE_SRV);
                }
                match &instance.target {
                    None => {}
                    Some(target) => {
                        let host = self.cache.hosts.get(target);
                        if host.map_or(true, |h| h.v4.is_none()) {
                            want(target, TYPE_A);
                        }
                        if host.map_or(true, |h| h.v6.is_none()) {
                            want(target, TYPE_AAAA);
                        }
                    }
                }
            }
        }

        let rtsp = rtsp_key(key);
        let rtsp_instance = self.cache.instances.get(&rtsp);
        if rtsp_instance.map_or(true, |i| i.port.is_none()) {
            want(&rtsp, TYPE_SRV);
        }
        if rtsp_instance.map_or(true, |i| i.txt.is_none()) {
            want(&rtsp, TYPE_TXT);
        }
        questions
    }
}

fn is_service_instance(name: &str) -> bool {
    name.strip_suffix(CONTROL_SERVICE_TYPE)
        .or_else(|| name.strip_suffix(RTSP_SERVICE_TYPE))
        .is_some_and(|prefix| prefix.len() > 1 && prefix.ends_with('.'))
}

/// `host._tobii-g3api._tcp.local.` -> `host._rtsp._tcp.local.`
fn rtsp_key(control_key: &str) -> String {
    format!("{}.{RTSP_SERVICE_TYPE}", hostname_of(control_key))
}

/// Strips the service type, leaving the instance label.
fn hostname_of(instance: &str) -> String {
    instance
        .strip_suffix(CONTROL_SERVICE_TYPE)
        .or_else(|| instance.strip_suffix(RTSP_SERVICE_TYPE))
        .map_or(instance, |v| v.trim_end_matches('.'))
        .to_owned()
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use common::DummyLogger;
    use pretty_assertions::assert_eq;

    struct Fixture {
        browser: Browser,
        services: Arc<Mutex<HashMap<String, DeviceService>>>,
        events: mpsc::UnboundedReceiver<ServiceEvent>,
    }

    fn fixture() -> Fixture {
        let services = Arc::new(Mutex::new(HashMap::new()));
        let (events_tx, events) = mpsc::unbounded_channel();
        let browser = Browser::new(services.clone(), events_tx, DummyLogger::new(), false);
        Fixture {
            browser,
            services,
            events,
        }
    }

    fn ptr(ttl: u32) -> Record {
        Record {
            name: CONTROL_SERVICE_TYPE.to_owned(),
            ttl,
            data: RecordData::Ptr(format!("glasses-X.{CONTROL_SERVICE_TYPE}")),
        }
    }

    fn control_details() -> Vec<Record> {
        vec![
            Record {
                name: format!("glasses-X.{CONTROL_SERVICE_TYPE}"),
                ttl: 120,
                data: RecordData::Srv {
                    port: 80,
                    target: "glasses-X.local.".to_owned(),
                },
            },
            Record {
                name: "glasses-X.local.".to_owned(),
                ttl: 120,
                data: RecordData::A(Ipv4Addr::new(192, 168, 1, 20)),
            },
        ]
    }

    fn rtsp_details() -> Vec<Record> {
        vec![
            Record {
                name: format!("glasses-X.{RTSP_SERVICE_TYPE}"),
                ttl: 120,
                data: RecordData::Srv {
                    port: 8554,
                    target: "glasses-X.local.".to_owned(),
                },
            },
            Record {
                name: format!("glasses-X.{RTSP_SERVICE_TYPE}"),
                ttl: 120,
                data: RecordData::Txt(vec![
                    ("path".to_owned(), Some("/live/all".to_owned())),
                    ("recordings".to_owned(), Some("/recordings".to_owned())),
                ]),
            },
        ]
    }

    #[tokio::test]
    async fn test_added_after_full_resolution() {
        let mut f = fixture();
        let now = Instant::now();

        let mut records = vec![ptr(120)];
        records.extend(control_details());
        records.extend(rtsp_details());
        f.browser.handle_records(records, now);

        let (kind, service) = f.events.try_recv().unwrap();
        assert_eq!(ServiceEventKind::Added, kind);
        assert_eq!("glasses-X", service.hostname);
        assert_eq!(Some(8554), service.rtsp_port);
        assert_eq!(Some("/live/all".to_owned()), service.rtsp_live_path);
        assert_eq!(
            "rtsp://glasses-X:8554/live/all",
            service
                .rtsp_url(false, IpPreference::Either)
                .unwrap()
                .unwrap()
                .as_str(),
        );
        assert_eq!(1, lock(&f.services).len());
    }

    #[tokio::test]
    async fn test_added_without_rtsp_waits_for_deadline() {
        let mut f = fixture();
        let now = Instant::now();

        let mut records = vec![ptr(120)];
        records.extend(control_details());
        f.browser.handle_records(records, now);

        // The RTSP half is still outstanding.
        assert!(f.events.try_recv().is_err());

        f.browser.tick(now + RESOLVE_TIMEOUT + TICK);
        let (kind, service) = f.events.try_recv().unwrap();
        assert_eq!(ServiceEventKind::Added, kind);
        assert_eq!(None, service.rtsp_port);
        assert_eq!(None, service.rtsp_live_path);
    }

    #[tokio::test]
    async fn test_incomplete_service_is_suppressed() {
        let mut f = fixture();
        let now = Instant::now();

        // Only the PTR, no details.
        f.browser.handle_records(vec![ptr(120)], now);
        f.browser.tick(now + RESOLVE_TIMEOUT + TICK);

        assert!(f.events.try_recv().is_err());
        assert!(lock(&f.services).is_empty());
        assert!(f.browser.tracked.is_empty());
    }

    #[tokio::test]
    async fn test_goodbye_removes_service() {
        let mut f = fixture();
        let now = Instant::now();

        let mut records = vec![ptr(120)];
        records.extend(control_details());
        records.extend(rtsp_details());
        f.browser.handle_records(records, now);
        f.events.try_recv().unwrap();

        f.browser.handle_records(vec![ptr(0)], now);
        let (kind, service) = f.events.try_recv().unwrap();
        assert_eq!(ServiceEventKind::Removed, kind);
        assert_eq!("glasses-X", service.hostname);
        assert!(lock(&f.services).is_empty());
    }

    #[tokio::test]
    async fn test_ttl_expiry_removes_service() {
        let mut f = fixture();
        let now = Instant::now();

        let mut records = vec![ptr(10)];
        records.extend(control_details());
        records.extend(rtsp_details());
        f.browser.handle_records(records, now);
        f.events.try_recv().unwrap();

        f.browser.tick(now + Duration::from_secs(11));
        let (kind, _) = f.events.try_recv().unwrap();
        assert_eq!(ServiceEventKind::Removed, kind);
    }

    #[tokio::test]
    async fn test_changed_address_publishes_update() {
        let mut f = fixture();
        let now = Instant::now();

        let mut records = vec![ptr(120)];
        records.extend(control_details());
        records.extend(rtsp_details());
        f.browser.handle_records(records, now);
        f.events.try_recv().unwrap();

        f.browser.handle_records(
            vec![Record {
                name: "glasses-X.local.".to_owned(),
                ttl: 120,
                data: RecordData::A(Ipv4Addr::new(192, 168, 1, 77)),
            }],
            now,
        );
        let (kind, service) = f.events.try_recv().unwrap();
        assert_eq!(ServiceEventKind::Updated, kind);
        assert_eq!(Some(Ipv4Addr::new(192, 168, 1, 77)), service.ipv4);
    }

    #[tokio::test]
    async fn test_missing_records_are_queried() {
        let mut f = fixture();
        let now = Instant::now();

        let questions = f.browser.handle_records(vec![ptr(120)], now);
        let names: Vec<(String, u16)> =
            questions.into_iter().map(|q| (q.name, q.qtype)).collect();
        assert_eq!(
            vec![
                (format!("glasses-x.{CONTROL_SERVICE_TYPE}"), TYPE_SRV),
                (format!("glasses-x.{RTSP_SERVICE_TYPE}"), TYPE_SRV),
                (format!("glasses-x.{RTSP_SERVICE_TYPE}"), TYPE_TXT),
            ],
            names,
        );

        // Once the SRV is known the host addresses are queried.
        let mut records = control_details();
        records.truncate(1);
        let questions = f.browser.handle_records(records, now + RETRY_INTERVAL);
        let names: Vec<(String, u16)> =
            questions.into_iter().map(|q| (q.name, q.qtype)).collect();
        assert_eq!(
            vec![
                ("glasses-x.local.".to_owned(), TYPE_A),
                ("glasses-x.local.".to_owned(), TYPE_AAAA),
                (format!("glasses-x.{RTSP_SERVICE_TYPE}"), TYPE_SRV),
                (format!("glasses-x.{RTSP_SERVICE_TYPE}"), TYPE_TXT),
            ],
            names,
        );
    }

    #[tokio::test]
    async fn test_wait_for_single_service_filters_by_address() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let v6_only = DeviceService {
            hostname: "a".to_owned(),
            service_type: CONTROL_SERVICE_TYPE.to_owned(),
            server: "a.local.".to_owned(),
            ipv4: None,
            ipv6: Some("fe80::1".parse().unwrap()),
            port: 80,
            rtsp_port: None,
            rtsp_live_path: None,
            rtsp_recordings_path: None,
        };
        let v4 = DeviceService {
            hostname: "b".to_owned(),
            ipv4: Some(Ipv4Addr::new(10, 0, 0, 2)),
            ipv6: None,
            ..v6_only.clone()
        };
        tx.send((ServiceEventKind::Added, v6_only)).unwrap();
        tx.send((ServiceEventKind::Added, v4.clone())).unwrap();

        let got =
            wait_for_single_service(&mut rx, Duration::from_secs(1), IpPreference::V4Only)
                .await
                .unwrap();
        assert_eq!(v4, got);
    }

    #[tokio::test]
    async fn test_wait_for_single_service_timeout() {
        let (_tx, mut rx) = mpsc::unbounded_channel::<ServiceEvent>();
        let err =
            wait_for_single_service(&mut rx, Duration::from_millis(20), IpPreference::Either)
                .await
                .unwrap_err();
        assert!(matches!(err, WaitForServiceError::Timeout));
    }
}
