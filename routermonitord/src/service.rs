use std::sync::{Arc, OnceLock};
use std::time::Duration;
use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use crate::config::{Config, ConfigWatcher};
use crate::notify::{self, Notifier};
use crate::reconcile::Reconciler;
use crate::source::ClientSource;
use crate::vendor::VendorLookup;

/// Why the service loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceExit {
    /// Cancelled by the owning code
    Requested,
    /// Stopped by SIGINT/SIGTERM; reported as a failure exit
    Signalled(String),
}

impl ServiceExit {
    pub fn exit_code(&self) -> i32 {
        match self {
            ServiceExit::Requested => 0,
            ServiceExit::Signalled(_) => 1,
        }
    }
}

/// Cancellation token plus the name of the signal that fired it, if any
#[derive(Clone, Default)]
pub struct Shutdown {
    token: CancellationToken,
    signal: Arc<OnceLock<String>>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.token.cancel();
    }

    pub fn signal(&self, name: &str) {
        let _ = self.signal.set(name.to_string());
        self.token.cancel();
    }

    pub fn is_requested(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn wait(&self) {
        self.token.cancelled().await
    }

    pub fn exit(&self) -> ServiceExit {
        match self.signal.get() {
            Some(name) => ServiceExit::Signalled(name.clone()),
            None => ServiceExit::Requested,
        }
    }
}

/// Cancel `shutdown` on ctrl-c, or SIGTERM on unix
pub fn listen_for_signals(shutdown: Shutdown) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        let name = {
            use tokio::signal::unix::{signal, SignalKind};
            match signal(SignalKind::terminate()) {
                Ok(mut term) => tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                    _ = shutdown.wait() => return,
                },
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => "SIGINT",
                        _ = shutdown.wait() => return,
                    }
                }
            }
        };
        #[cfg(not(unix))]
        let name = tokio::select! {
            _ = tokio::signal::ctrl_c() => "SIGINT",
            _ = shutdown.wait() => return,
        };

        tracing::warn!("Signal {} received; stopping after the current cycle", name);
        shutdown.signal(name);
    })
}

/// When the next reconcile is due
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    next_run: Instant,
}

impl Schedule {
    /// The first run is due immediately
    pub fn new(now: Instant) -> Self {
        Self { next_run: now }
    }

    pub fn is_due(&self, now: Instant) -> bool {
        now >= self.next_run
    }

    pub fn fire_now(&mut self, now: Instant) {
        self.next_run = now;
    }

    /// Step to the next slot after `now`; slots missed during a long
    /// cycle are skipped rather than run back to back.
    pub fn advance(&mut self, interval: Duration, now: Instant) {
        self.next_run += interval;
        while self.next_run <= now {
            self.next_run += interval;
        }
    }
}

/// Everything rebuilt from config on a hot reload
pub struct Backends<S, V, N> {
    pub source: S,
    pub vendors: V,
    pub notifier: N,
}

pub type BuildBackends<S, V, N> = Box<dyn Fn(&Config) -> Result<Backends<S, V, N>> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Polling,
    ShuttingDown,
}

pub struct Service<S, V, N> {
    watcher: ConfigWatcher,
    reconciler: Reconciler<S, V>,
    notifier: N,
    build: BuildBackends<S, V, N>,
}

impl<S: ClientSource, V: VendorLookup, N: Notifier> Service<S, V, N> {
    pub fn new(
        watcher: ConfigWatcher,
        reconciler: Reconciler<S, V>,
        notifier: N,
        build: BuildBackends<S, V, N>,
    ) -> Self {
        Self {
            watcher,
            reconciler,
            notifier,
            build,
        }
    }

    /// Poll until shutdown. Shutdown is only observed between cycles; the
    /// store is closed before returning. Errors are fatal conditions only.
    pub async fn run(mut self, shutdown: Shutdown) -> Result<ServiceExit> {
        tracing::info!(
            "Service started; updating every {}s",
            self.watcher.config().service.update_interval_secs
        );

        let mut schedule = Schedule::new(Instant::now());
        let mut state = State::Polling;

        loop {
            state = match state {
                State::Polling => {
                    self.check_config(&mut schedule);
                    if schedule.is_due(Instant::now()) {
                        let cycle = self.run_cycle().await;
                        schedule.advance(self.watcher.config().update_interval(), Instant::now());
                        if let Err(e) = cycle {
                            self.close_store().await;
                            return Err(e);
                        }
                    }
                    State::Idle
                }
                State::Idle => {
                    if shutdown.is_requested() {
                        State::ShuttingDown
                    } else {
                        tokio::select! {
                            _ = tokio::time::sleep(self.watcher.config().tick()) => State::Polling,
                            _ = shutdown.wait() => State::ShuttingDown,
                        }
                    }
                }
                State::ShuttingDown => break,
            };
        }

        self.close_store().await;
        let exit = shutdown.exit();
        tracing::info!("Service stopped ({:?})", exit);
        Ok(exit)
    }

    fn check_config(&mut self, schedule: &mut Schedule) {
        let previous = self.watcher.config().clone();
        match self.watcher.reload_if_changed() {
            Ok(false) => {}
            Ok(true) => {
                tracing::warn!("Config file {} reloaded", self.watcher.path().display());
                let config = self.watcher.config();
                if config.inventory != previous.inventory {
                    tracing::warn!("Inventory settings changed; restart to apply them");
                }
                match (self.build)(config) {
                    Ok(backends) => {
                        self.reconciler.replace_backends(backends.source, backends.vendors);
                        self.notifier = backends.notifier;
                    }
                    Err(e) => tracing::error!("Keeping previous DHCP/vendor/notify setup: {:#}", e),
                }
                schedule.fire_now(Instant::now());
            }
            Err(e) => tracing::error!("Config reload failed; keeping previous config: {}", e),
        }
    }

    /// One poll. Recoverable failures are logged and swallowed.
    async fn run_cycle(&self) -> Result<()> {
        match self.reconciler.bootstrap(false).await {
            Ok(Some(_)) => return Ok(()),
            Ok(None) => {}
            Err(e) if e.is_fatal() => return Err(e).context("Inventory bootstrap failed"),
            Err(e) => {
                tracing::error!("Inventory bootstrap failed: {}", e);
                return Ok(());
            }
        }

        match self.reconciler.reconcile().await {
            Ok(events) => {
                if !events.is_empty() {
                    let sent = notify::dispatch(&self.notifier, &events).await;
                    tracing::info!("{} changes, {} notifications sent", events.len(), sent);
                }
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e).context("Reconciliation hit an inconsistent inventory"),
            Err(e) => {
                tracing::error!("Update failed: {}", e);
                Ok(())
            }
        }
    }

    async fn close_store(&self) {
        if let Err(e) = self.reconciler.store().shutdown().await {
            tracing::error!("Failed to close inventory: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use shared::protocol::VENDOR_NOT_FOUND;
    use shared::{ClientRecord, InventoryEntry, MacAddr};
    use crate::error::SourceError;
    use crate::inventory::{InventoryDb, InventoryHandle};
    use crate::source::Snapshot;

    const CONFIG: &str = r#"
        [dhcp]
        kind = "dd-wrt"
        host = "192.0.2.1"

        [service]
        update_interval_secs = 3600
        tick_secs = 1
    "#;

    fn laptop() -> ClientRecord {
        ClientRecord {
            mac: "aa:bb:cc:00:01:02".parse().unwrap(),
            hostname: "laptop".to_string(),
            ip: "10.0.0.2".to_string(),
            lease_expiry: 0,
        }
    }

    /// Serves one client, or fails like an unreachable router
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ClientSource for CountingSource {
        async fn fetch_clients(&self) -> std::result::Result<Snapshot, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SourceError::Remote("router unreachable".to_string()));
            }
            let record = laptop();
            Ok(Snapshot::from([(record.mac, record)]))
        }
    }

    struct NoVendors;

    impl VendorLookup for NoVendors {
        async fn lookup_vendor(&self, _mac: &MacAddr) -> String {
            VENDOR_NOT_FOUND.to_string()
        }
    }

    /// Another writer stores the client while its vendor is being looked up
    struct RacingVendors {
        store: InventoryHandle,
    }

    impl VendorLookup for RacingVendors {
        async fn lookup_vendor(&self, _mac: &MacAddr) -> String {
            let entry = InventoryEntry::new(laptop(), "Acme".to_string(), 1);
            self.store.insert(entry).await.unwrap();
            "Acme".to_string()
        }
    }

    struct CountingNotifier {
        sent: Arc<AtomicUsize>,
    }

    impl Notifier for CountingNotifier {
        async fn notify(&self, _subject: &str, _message: &str) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn config_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        file
    }

    async fn empty_store() -> InventoryHandle {
        let store = InventoryHandle::spawn(InventoryDb::open_in_memory("clients").unwrap());
        store.ensure_table().await.unwrap();
        store
    }

    /// Poll `counter` until it reaches `target`; false on timeout
    async fn wait_for(counter: &AtomicUsize, target: usize) -> bool {
        for _ in 0..250 {
            if counter.load(Ordering::SeqCst) >= target {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[test]
    fn test_schedule_fires_first_then_waits() {
        let start = Instant::now();
        let interval = Duration::from_secs(600);
        let mut schedule = Schedule::new(start);
        assert!(schedule.is_due(start));

        schedule.advance(interval, start);
        assert!(!schedule.is_due(start + Duration::from_secs(599)));
        assert!(schedule.is_due(start + interval));

        schedule.fire_now(start + Duration::from_secs(10));
        assert!(schedule.is_due(start + Duration::from_secs(10)));
    }

    #[test]
    fn test_schedule_skips_missed_slots() {
        let start = Instant::now();
        let interval = Duration::from_secs(60);
        let mut schedule = Schedule::new(start);

        // Slots at 60s..180s were missed; the next one is 240s, not 120s
        schedule.advance(interval, start + Duration::from_secs(200));
        assert!(!schedule.is_due(start + Duration::from_secs(239)));
        assert!(schedule.is_due(start + Duration::from_secs(240)));
    }

    #[test]
    fn test_exit_codes() {
        let shutdown = Shutdown::new();
        shutdown.request();
        assert_eq!(shutdown.exit(), ServiceExit::Requested);
        assert_eq!(shutdown.exit().exit_code(), 0);

        let shutdown = Shutdown::new();
        shutdown.signal("SIGTERM");
        assert!(shutdown.is_requested());
        assert_eq!(shutdown.exit(), ServiceExit::Signalled("SIGTERM".to_string()));
        assert_eq!(shutdown.exit().exit_code(), 1);
    }

    #[tokio::test]
    async fn test_service_runs_a_cycle_then_stops_on_request() {
        let file = config_file();
        let watcher = ConfigWatcher::load(file.path()).unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));
        let store = empty_store().await;

        let source = CountingSource { calls: fetches.clone(), fail: false };
        let reconciler = Reconciler::new(source, NoVendors, store.clone());
        let build: BuildBackends<CountingSource, NoVendors, CountingNotifier> =
            Box::new(|_config| anyhow::bail!("config never changes here"));
        let service = Service::new(watcher, reconciler, CountingNotifier { sent: sent.clone() }, build);

        let shutdown = Shutdown::new();
        let task = tokio::spawn(service.run(shutdown.clone()));

        // First cycle runs immediately on start
        assert!(wait_for(&sent, 1).await);
        shutdown.request();

        let exit = task.await.unwrap().unwrap();
        assert_eq!(exit, ServiceExit::Requested);
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
        assert_eq!(sent.load(Ordering::SeqCst), 1);
        // The store was closed on the way out
        assert!(store.get_all().await.is_err());
    }

    #[tokio::test]
    async fn test_failed_cycle_keeps_running_and_config_edit_rebuilds() {
        let file = config_file();
        let watcher = ConfigWatcher::load(file.path()).unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));
        let builds = Arc::new(AtomicUsize::new(0));
        let store = empty_store().await;

        let source = CountingSource { calls: fetches.clone(), fail: true };
        let reconciler = Reconciler::new(source, NoVendors, store.clone());
        let (build_fetches, build_sent, build_count) = (fetches.clone(), sent.clone(), builds.clone());
        let build: BuildBackends<CountingSource, NoVendors, CountingNotifier> = Box::new(move |_config| {
            build_count.fetch_add(1, Ordering::SeqCst);
            Ok(Backends {
                source: CountingSource { calls: build_fetches.clone(), fail: false },
                vendors: NoVendors,
                notifier: CountingNotifier { sent: build_sent.clone() },
            })
        });
        let service = Service::new(watcher, reconciler, CountingNotifier { sent: sent.clone() }, build);

        let shutdown = Shutdown::new();
        let task = tokio::spawn(service.run(shutdown.clone()));

        // The router is down: the cycle is logged and the loop stays up
        assert!(wait_for(&fetches, 1).await);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!task.is_finished());
        assert!(store.get_all().await.unwrap().is_empty());

        // An edit fires a cycle right away, long before the hour is up
        let next = file.path().with_extension("next");
        std::fs::write(&next, format!("{}\n[vendor]\nmin_spacing_ms = 0\n", CONFIG)).unwrap();
        std::fs::File::options()
            .write(true)
            .open(&next)
            .unwrap()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();
        std::fs::rename(&next, file.path()).unwrap();

        assert!(wait_for(&sent, 1).await);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(store.get_all().await.unwrap().len(), 1);

        shutdown.request();
        assert_eq!(task.await.unwrap().unwrap(), ServiceExit::Requested);
    }

    #[tokio::test]
    async fn test_duplicate_key_stops_the_service() {
        let file = config_file();
        let watcher = ConfigWatcher::load(file.path()).unwrap();

        let fetches = Arc::new(AtomicUsize::new(0));
        let sent = Arc::new(AtomicUsize::new(0));
        let store = empty_store().await;

        let source = CountingSource { calls: fetches.clone(), fail: false };
        let vendors = RacingVendors { store: store.clone() };
        let reconciler = Reconciler::new(source, vendors, store.clone());
        let build: BuildBackends<CountingSource, RacingVendors, CountingNotifier> =
            Box::new(|_config| anyhow::bail!("config never changes here"));
        let service = Service::new(watcher, reconciler, CountingNotifier { sent: sent.clone() }, build);

        let shutdown = Shutdown::new();
        let err = tokio::time::timeout(Duration::from_secs(5), service.run(shutdown.clone()))
            .await
            .unwrap()
            .unwrap_err();

        assert!(format!("{:#}", err).contains("duplicate inventory key aa:bb:cc:00:01:02"));
        assert!(!shutdown.is_requested());
        assert_eq!(sent.load(Ordering::SeqCst), 0);
        assert!(store.get_all().await.is_err());
    }
}
