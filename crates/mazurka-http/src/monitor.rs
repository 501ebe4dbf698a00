//! Monitoring and defenses: per-address counters, threshold monitors
//! and remedial actions.
//!
//! A background timer thread wakes every second, evaluates monitors
//! whose period has elapsed, fires the attached defenses for exceeded
//! thresholds, and prunes address records that have been inactive for
//! longer than the longest configured period.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::context::Http;
use crate::trace::Trace;
use crate::uri::Uri;

/// The tracked counters, per address and global.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Counter {
    ActiveClients = 0,
    ActiveConnections,
    ActiveRequests,
    ActiveProcesses,
    BadRequestErrors,
    Errors,
    LimitErrors,
    Memory,
    NotFoundErrors,
    NetworkIo,
    Requests,
    SslErrors,
}

pub const COUNTER_COUNT: usize = 12;

impl Counter {
    pub fn name(&self) -> &'static str {
        match self {
            Counter::ActiveClients => "ActiveClients",
            Counter::ActiveConnections => "ActiveConnections",
            Counter::ActiveRequests => "ActiveRequests",
            Counter::ActiveProcesses => "ActiveProcesses",
            Counter::BadRequestErrors => "BadRequestErrors",
            Counter::Errors => "Errors",
            Counter::LimitErrors => "LimitErrors",
            Counter::Memory => "Memory",
            Counter::NotFoundErrors => "NotFoundErrors",
            Counter::NetworkIo => "NetworkIO",
            Counter::Requests => "Requests",
            Counter::SslErrors => "SSLErrors",
        }
    }

    pub fn parse(name: &str) -> Option<Counter> {
        Some(match name {
            "ActiveClients" => Counter::ActiveClients,
            "ActiveConnections" => Counter::ActiveConnections,
            "ActiveRequests" => Counter::ActiveRequests,
            "ActiveProcesses" => Counter::ActiveProcesses,
            "BadRequestErrors" => Counter::BadRequestErrors,
            "Errors" => Counter::Errors,
            "LimitErrors" => Counter::LimitErrors,
            "Memory" => Counter::Memory,
            "NotFoundErrors" => Counter::NotFoundErrors,
            "NetworkIO" => Counter::NetworkIo,
            "Requests" => Counter::Requests,
            "SSLErrors" => Counter::SslErrors,
            _ => return None,
        })
    }
}

/// Per-client-address record: counters plus ban/delay state.
pub struct AddressRecord {
    pub counters: [i64; COUNTER_COUNT],
    pub banned_until: Option<Instant>,
    pub ban_status: u16,
    pub ban_message: String,
    pub delay_until: Option<Instant>,
    pub delay: Duration,
    pub last_activity: Instant,
}

impl AddressRecord {
    fn new() -> AddressRecord {
        AddressRecord {
            counters: [0; COUNTER_COUNT],
            banned_until: None,
            ban_status: 503,
            ban_message: String::new(),
            delay_until: None,
            delay: Duration::ZERO,
            last_activity: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relation {
    Above,
    Below,
}

/// A threshold watch over one counter.
pub struct Monitor {
    pub counter: Counter,
    pub relation: Relation,
    pub limit: i64,
    pub period: Duration,
    pub defenses: Vec<String>,
    last_checked: Instant,
}

/// A named remedial action with its argument map.
pub struct Defense {
    pub name: String,
    pub remedy: String,
    pub args: HashMap<String, String>,
    /// Suppress re-firing within this window.
    pub suppress: Duration,
    last_fired: Option<Instant>,
}

/// Everything a remedy needs to act.
pub struct RemedyContext<'a> {
    pub system: &'a MonitorSystem,
    pub ip: Option<IpAddr>,
    pub counter: Counter,
    pub value: i64,
    pub limit: i64,
    pub args: &'a HashMap<String, String>,
    pub trace: &'a Trace,
}

pub type RemedyFn = Arc<dyn Fn(&RemedyContext) + Send + Sync>;

pub struct MonitorSystem {
    addresses: Mutex<HashMap<IpAddr, AddressRecord>>,
    global: Mutex<[i64; COUNTER_COUNT]>,
    monitors: Mutex<Vec<Monitor>>,
    defenses: Mutex<HashMap<String, Defense>>,
    remedies: RwLock<HashMap<String, RemedyFn>>,
    trace: RwLock<Arc<Trace>>,
    stop: Arc<AtomicBool>,
}

impl MonitorSystem {
    pub fn new() -> MonitorSystem {
        let system = MonitorSystem {
            addresses: Mutex::new(HashMap::new()),
            global: Mutex::new([0; COUNTER_COUNT]),
            monitors: Mutex::new(Vec::new()),
            defenses: Mutex::new(HashMap::new()),
            remedies: RwLock::new(HashMap::new()),
            trace: RwLock::new(Arc::new(Trace::disabled())),
            stop: Arc::new(AtomicBool::new(false)),
        };
        system.register_builtin_remedies();
        system
    }

    pub fn set_trace(&self, trace: Arc<Trace>) {
        *self.trace.write().expect("monitor trace poisoned") = trace;
    }

    fn trace(&self) -> Arc<Trace> {
        self.trace.read().expect("monitor trace poisoned").clone()
    }

    // ── counters ──

    /// Bump a counter for an address (and the global tally).
    pub fn inc(&self, ip: Option<IpAddr>, counter: Counter, delta: i64) {
        {
            let mut global = self.global.lock().expect("counters poisoned");
            global[counter as usize] += delta;
        }
        if let Some(ip) = ip {
            let mut addresses = self.addresses.lock().expect("addresses poisoned");
            let record = addresses.entry(ip).or_insert_with(AddressRecord::new);
            record.counters[counter as usize] += delta;
            record.last_activity = Instant::now();
        }
    }

    /// Mark a client address active, maintaining the ActiveClients
    /// tally on first sight.
    pub fn touch_client(&self, ip: IpAddr) {
        let mut addresses = self.addresses.lock().expect("addresses poisoned");
        let fresh = !addresses.contains_key(&ip);
        let record = addresses.entry(ip).or_insert_with(AddressRecord::new);
        record.last_activity = Instant::now();
        if fresh {
            drop(addresses);
            self.inc(None, Counter::ActiveClients, 1);
        }
    }

    pub fn global_counter(&self, counter: Counter) -> i64 {
        self.global.lock().expect("counters poisoned")[counter as usize]
    }

    pub fn address_counter(&self, ip: IpAddr, counter: Counter) -> i64 {
        self.addresses
            .lock()
            .expect("addresses poisoned")
            .get(&ip)
            .map(|r| r.counters[counter as usize])
            .unwrap_or(0)
    }

    /// Ban state for an address, if an active ban exists.
    pub fn banned(&self, ip: IpAddr) -> Option<(u16, String)> {
        let mut addresses = self.addresses.lock().expect("addresses poisoned");
        let record = addresses.get_mut(&ip)?;
        match record.banned_until {
            Some(until) if until > Instant::now() => {
                Some((record.ban_status, record.ban_message.clone()))
            }
            Some(_) => {
                record.banned_until = None;
                None
            }
            None => None,
        }
    }

    /// Pending event delay for an address.
    pub fn delay(&self, ip: IpAddr) -> Option<Duration> {
        let addresses = self.addresses.lock().expect("addresses poisoned");
        let record = addresses.get(&ip)?;
        match record.delay_until {
            Some(until) if until > Instant::now() => Some(record.delay),
            _ => None,
        }
    }

    pub fn ban(&self, ip: IpAddr, period: Duration, status: u16, message: &str) {
        let mut addresses = self.addresses.lock().expect("addresses poisoned");
        let record = addresses.entry(ip).or_insert_with(AddressRecord::new);
        record.banned_until = Some(Instant::now() + period);
        record.ban_status = status;
        record.ban_message = message.to_string();
    }

    // ── configuration ──

    pub fn add_monitor(
        &self,
        counter: Counter,
        relation: Relation,
        limit: i64,
        period: Duration,
        defenses: &[&str],
    ) {
        self.monitors.lock().expect("monitors poisoned").push(Monitor {
            counter,
            relation,
            limit,
            period,
            defenses: defenses.iter().map(|d| d.to_string()).collect(),
            last_checked: Instant::now(),
        });
    }

    pub fn add_defense(
        &self,
        name: impl Into<String>,
        remedy: impl Into<String>,
        args: HashMap<String, String>,
    ) {
        let name = name.into();
        let suppress = args
            .get("SUPPRESS")
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        self.defenses.lock().expect("defenses poisoned").insert(
            name.clone(),
            Defense {
                name,
                remedy: remedy.into(),
                args,
                suppress,
                last_fired: None,
            },
        );
    }

    pub fn add_remedy(&self, name: impl Into<String>, remedy: RemedyFn) {
        self.remedies
            .write()
            .expect("remedies poisoned")
            .insert(name.into(), remedy);
    }

    // ── evaluation ──

    /// One evaluation pass; called by the timer thread, public so the
    /// test suites can drive it synchronously.
    pub fn check_monitors(&self) {
        let now = Instant::now();
        let due: Vec<(Counter, Relation, i64, Vec<String>)> = {
            let mut monitors = self.monitors.lock().expect("monitors poisoned");
            monitors
                .iter_mut()
                .filter(|m| now.duration_since(m.last_checked) >= m.period)
                .map(|m| {
                    m.last_checked = now;
                    (m.counter, m.relation, m.limit, m.defenses.clone())
                })
                .collect()
        };
        for (counter, relation, limit, defenses) in due {
            if per_address(counter) {
                let exceeded: Vec<(IpAddr, i64)> = {
                    let addresses = self.addresses.lock().expect("addresses poisoned");
                    addresses
                        .iter()
                        .filter(|(_, r)| compare(r.counters[counter as usize], relation, limit))
                        .map(|(ip, r)| (*ip, r.counters[counter as usize]))
                        .collect()
                };
                for (ip, value) in exceeded {
                    self.fire_defenses(Some(ip), counter, value, limit, &defenses);
                }
                self.reset_period_counters(counter);
            } else {
                let value = self.global_counter(counter);
                if compare(value, relation, limit) {
                    self.fire_defenses(None, counter, value, limit, &defenses);
                }
                self.reset_period_counters(counter);
            }
        }
        self.prune_addresses(now);
    }

    /// Error-class counters accumulate per period and reset after each
    /// evaluation; gauges (Active*) do not.
    fn reset_period_counters(&self, counter: Counter) {
        if matches!(
            counter,
            Counter::BadRequestErrors
                | Counter::Errors
                | Counter::LimitErrors
                | Counter::NotFoundErrors
                | Counter::Requests
                | Counter::NetworkIo
                | Counter::SslErrors
        ) {
            let mut addresses = self.addresses.lock().expect("addresses poisoned");
            for record in addresses.values_mut() {
                record.counters[counter as usize] = 0;
            }
            drop(addresses);
            self.global.lock().expect("counters poisoned")[counter as usize] = 0;
        }
    }

    fn fire_defenses(
        &self,
        ip: Option<IpAddr>,
        counter: Counter,
        value: i64,
        limit: i64,
        defenses: &[String],
    ) {
        for name in defenses {
            let (remedy_name, args) = {
                let mut defenses = self.defenses.lock().expect("defenses poisoned");
                let Some(defense) = defenses.get_mut(name) else {
                    continue;
                };
                if let Some(last) = defense.last_fired
                    && defense.suppress > Duration::ZERO
                    && last.elapsed() < defense.suppress
                {
                    continue;
                }
                defense.last_fired = Some(Instant::now());
                (defense.remedy.clone(), defense.args.clone())
            };
            let Some(remedy) = self
                .remedies
                .read()
                .expect("remedies poisoned")
                .get(&remedy_name)
                .cloned()
            else {
                tracing::warn!(remedy = %remedy_name, "unknown remedy");
                continue;
            };
            let trace = self.trace();
            trace.event(
                "monitor.defense",
                2,
                &[
                    ("defense", name),
                    ("counter", counter.name()),
                    ("value", &value.to_string()),
                    ("limit", &limit.to_string()),
                ],
            );
            remedy(&RemedyContext {
                system: self,
                ip,
                counter,
                value,
                limit,
                args: &args,
                trace: &trace,
            });
        }
    }

    /// Drop records inactive longer than the longest monitor period.
    fn prune_addresses(&self, now: Instant) {
        let longest = self
            .monitors
            .lock()
            .expect("monitors poisoned")
            .iter()
            .map(|m| m.period)
            .max()
            .unwrap_or(Duration::from_secs(300));
        let mut removed = 0i64;
        {
            let mut addresses = self.addresses.lock().expect("addresses poisoned");
            addresses.retain(|_, r| {
                let keep = r.banned_until.map(|b| b > now).unwrap_or(false)
                    || now.duration_since(r.last_activity) <= longest;
                if !keep {
                    removed += 1;
                }
                keep
            });
        }
        if removed > 0 {
            self.inc(None, Counter::ActiveClients, -removed);
        }
    }

    // ── timer thread ──

    pub fn start(http: Arc<Http>) {
        http.monitor.set_trace(http.trace());
        let stop = http.monitor.stop.clone();
        std::thread::Builder::new()
            .name("mazurka-monitor".to_string())
            .spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_secs(1));
                    http.monitor.check_monitors();
                }
            })
            .ok();
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    // ── built-in remedies ──

    fn register_builtin_remedies(&self) {
        let mut remedies = self.remedies.write().expect("remedies poisoned");

        remedies.insert(
            "ban".into(),
            Arc::new(|cx: &RemedyContext| {
                let Some(ip) = cx.ip else { return };
                let period = arg_secs(cx.args, "PERIOD", 300);
                let status = cx
                    .args
                    .get("STATUS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(503);
                let message = cx
                    .args
                    .get("MESSAGE")
                    .cloned()
                    .unwrap_or_else(|| "Access temporarily disabled".into());
                cx.system.ban(ip, period, status, &message);
                cx.trace.event(
                    "monitor.ban.start",
                    1,
                    &[("ip", &ip.to_string()), ("period", &period.as_secs().to_string())],
                );
            }) as RemedyFn,
        );

        remedies.insert(
            "delay".into(),
            Arc::new(|cx: &RemedyContext| {
                let Some(ip) = cx.ip else { return };
                let period = arg_secs(cx.args, "PERIOD", 300);
                let delay = arg_secs(cx.args, "DELAY", 1);
                let mut addresses = cx.system.addresses.lock().expect("addresses poisoned");
                let record = addresses.entry(ip).or_insert_with(AddressRecord::new);
                record.delay_until = Some(Instant::now() + period);
                record.delay = delay;
                cx.trace
                    .event("monitor.delay.start", 2, &[("ip", &ip.to_string())]);
            }) as RemedyFn,
        );

        remedies.insert(
            "cmd".into(),
            Arc::new(|cx: &RemedyContext| {
                let Some(template) = cx.args.get("CMD") else { return };
                let cmd = expand_remedy_template(template, cx);
                match std::process::Command::new("sh").arg("-c").arg(&cmd).status() {
                    Ok(status) if !status.success() => {
                        tracing::warn!(cmd, code = status.code(), "remedy command failed");
                    }
                    Err(err) => tracing::warn!(cmd, error = %err, "remedy command failed"),
                    _ => {}
                }
            }) as RemedyFn,
        );

        remedies.insert(
            "http".into(),
            Arc::new(|cx: &RemedyContext| {
                let Some(uri_template) = cx.args.get("URI") else { return };
                let uri = expand_remedy_template(uri_template, cx);
                let body = cx
                    .args
                    .get("MESSAGE")
                    .map(|m| expand_remedy_template(m, cx));
                let client = crate::client::Client::detached();
                let outcome = match body {
                    Some(body) => client.post(&uri, body.into_bytes()),
                    None => client.get(&uri),
                };
                if let Err(err) = outcome {
                    tracing::warn!(uri, error = %err, "http remedy failed");
                }
            }) as RemedyFn,
        );

        remedies.insert(
            "email".into(),
            Arc::new(|cx: &RemedyContext| {
                let Some(to) = cx.args.get("TO") else { return };
                let subject = cx
                    .args
                    .get("SUBJECT")
                    .map(|s| expand_remedy_template(s, cx))
                    .unwrap_or_else(|| format!("{} exceeded", cx.counter.name()));
                let message = cx
                    .args
                    .get("MESSAGE")
                    .map(|m| expand_remedy_template(m, cx))
                    .unwrap_or_default();
                let cmd = format!(
                    "printf 'Subject: {subject}\\n\\n{message}\\n' | sendmail {to}"
                );
                if let Err(err) = std::process::Command::new("sh").arg("-c").arg(&cmd).status() {
                    tracing::warn!(error = %err, "email remedy failed");
                }
            }) as RemedyFn,
        );

        remedies.insert(
            "log".into(),
            Arc::new(|cx: &RemedyContext| {
                let message = cx
                    .args
                    .get("MESSAGE")
                    .map(|m| expand_remedy_template(m, cx))
                    .unwrap_or_else(|| {
                        format!("{} exceeded: {} > {}", cx.counter.name(), cx.value, cx.limit)
                    });
                cx.trace.event("monitor.log", 1, &[("msg", &message)]);
                tracing::warn!(counter = cx.counter.name(), value = cx.value, limit = cx.limit, "{message}");
            }) as RemedyFn,
        );

        remedies.insert(
            "restart".into(),
            Arc::new(|cx: &RemedyContext| {
                cx.trace.event("monitor.restart", 0, &[]);
                tracing::error!(
                    counter = cx.counter.name(),
                    value = cx.value,
                    "restart remedy invoked; signalling shutdown"
                );
                // The embedding host decides what restart means; the
                // engine quiesces.
                cx.system.stop.store(true, Ordering::Release);
            }) as RemedyFn,
        );
    }
}

impl Default for MonitorSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn arg_secs(args: &HashMap<String, String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(args.get(key).and_then(|v| v.parse().ok()).unwrap_or(default))
}

fn compare(value: i64, relation: Relation, limit: i64) -> bool {
    match relation {
        Relation::Above => value > limit,
        Relation::Below => value < limit,
    }
}

/// Counters that make sense tracked per client address.
fn per_address(counter: Counter) -> bool {
    !matches!(counter, Counter::Memory | Counter::ActiveProcesses | Counter::ActiveClients)
}

/// `${IP}`, `${COUNTER}`, `${VALUE}`, `${LIMIT}`, `${DATE}` in remedy
/// argument templates.
fn expand_remedy_template(template: &str, cx: &RemedyContext) -> String {
    Uri::expand_template(template, |token| match token {
        "IP" => Some(cx.ip.map(|ip| ip.to_string()).unwrap_or_default()),
        "COUNTER" => Some(cx.counter.name().to_string()),
        "VALUE" => Some(cx.value.to_string()),
        "LIMIT" => Some(cx.limit.to_string()),
        "DATE" => Some(httpdate::fmt_http_date(std::time::SystemTime::now())),
        _ => None,
    })
}
