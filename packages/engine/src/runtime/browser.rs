// packages/engine/src/runtime/browser.rs
//! Chromium-backed engine
//!
//! [`BrowserLauncher`] starts a Chromium-family browser with remote
//! debugging enabled in a throwaway profile directory, waits for it to
//! announce its DevTools endpoint and attaches to it over CDP with
//! `headless_chrome`. The browser process is watched separately: when it
//! exits for any reason the engine's disconnect signal fires.
//!
//! Every session is a browser context (an incognito-like profile inside the
//! shared browser). Solvers open pages in it through [`BrowserSession`];
//! resetting a session closes its pages and closing it disposes the context.
//! `headless_chrome` is a blocking client, so each CDP call runs on the
//! blocking pool.

use crate::runtime::engine::{
    AutomationEngine, DisconnectNotifier, DisconnectSignal, EngineLauncher, EngineSession,
};
use crate::runtime::process_manager::{ProcessManager, SpawnConfig};
use crate::utils::config::EngineSection;
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use headless_chrome::browser::context::Context;
use headless_chrome::protocol::cdp::Target;
use headless_chrome::{Browser, Tab};
use parking_lot::Mutex;
use std::any::Any;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// File the browser writes into its profile once DevTools is listening
const DEVTOOLS_PORT_FILE: &str = "DevToolsActivePort";

/// How long a closing browser gets before SIGKILL
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// The CDP connection must survive long idle stretches in the pool
const CDP_IDLE_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Fixed flags for an automation browser
const BASE_FLAGS: &[&str] = &[
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-dev-shm-usage",
    "--disable-accelerated-2d-canvas",
    "--no-first-run",
    "--no-zygote",
    "--disable-gpu",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-ipc-flooding-protection",
    "--disable-background-networking",
    "--disable-default-apps",
    "--disable-extensions",
    "--disable-sync",
    "--disable-translate",
    "--disable-features=TranslateUI,AudioServiceOutOfProcess",
    "--hide-scrollbars",
    "--metrics-recording-only",
    "--mute-audio",
    "--no-default-browser-check",
    "--safebrowsing-disable-auto-update",
    "--disable-client-side-phishing-detection",
    "--disable-component-update",
    "--disable-domain-reliability",
    "--disable-hang-monitor",
    "--disable-prompt-on-repost",
    "--memory-pressure-off",
];

/// Launches browser processes
pub struct BrowserLauncher {
    config: EngineSection,
    process: Arc<ProcessManager>,
}

impl BrowserLauncher {
    pub fn new(config: EngineSection) -> Self {
        let process = Arc::new(ProcessManager::new(config.executable.as_ref().map(PathBuf::from)));
        Self { config, process }
    }

    /// Command line for a browser using `profile_dir`
    pub fn launch_args(&self, profile_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = vec![
            format!("--window-size={},{}", self.config.width, self.config.height),
            format!("--user-data-dir={}", profile_dir.display()),
            // Port 0: the browser picks one and writes it to DevToolsActivePort
            "--remote-debugging-port=0".to_string(),
        ];
        args.extend(BASE_FLAGS.iter().map(|flag| flag.to_string()));
        if self.config.headless {
            args.push("--headless=new".to_string());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push("about:blank".to_string());
        args
    }

    /// Start a browser and attach to it over CDP
    pub async fn launch_browser(&self) -> Result<Arc<BrowserEngine>> {
        let process = self.start_process().await?;

        let cdp = match connect_devtools(process.endpoint.ws_url()).await {
            Ok(cdp) => cdp,
            Err(e) => {
                process.stop().await;
                return Err(e);
            }
        };

        info!(instance = %process.instance, "Attached to browser over CDP");
        Ok(Arc::new(BrowserEngine {
            process,
            cdp,
            closed: AtomicBool::new(false),
        }))
    }

    /// Spawn the browser and wait until DevTools is listening
    async fn start_process(&self) -> Result<BrowserProcess> {
        let instance = ulid::Ulid::new().to_string().to_lowercase();
        let profile_dir = std::env::temp_dir().join(format!("solver-engine-{}", instance));
        std::fs::create_dir_all(&profile_dir)?;

        let mut child = match self
            .process
            .spawn(SpawnConfig {
                args: self.launch_args(&profile_dir),
                ..Default::default()
            })
            .await
        {
            Ok(child) => child,
            Err(e) => {
                remove_profile(&profile_dir);
                return Err(e);
            }
        };

        let pid = child.id();
        let endpoint = match wait_for_devtools(&mut child, &profile_dir).await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    warn!(error = %kill_err, "Failed to kill browser after launch failure");
                }
                remove_profile(&profile_dir);
                return Err(e);
            }
        };

        info!(?pid, port = endpoint.port, instance = %instance, "Browser listening for DevTools");

        let notifier = Arc::new(DisconnectNotifier::new());
        let watcher = tokio::spawn(watch_process(child, Arc::clone(&notifier)));

        Ok(BrowserProcess {
            instance,
            pid,
            endpoint,
            profile_dir,
            process: Arc::clone(&self.process),
            notifier,
            watcher: Mutex::new(Some(watcher)),
        })
    }
}

#[async_trait]
impl EngineLauncher for BrowserLauncher {
    async fn launch(&self) -> Result<Arc<dyn AutomationEngine>> {
        let engine: Arc<dyn AutomationEngine> = self.launch_browser().await?;
        Ok(engine)
    }
}

/// Where a browser accepts DevTools connections
#[derive(Debug, Clone, PartialEq, Eq)]
struct DevToolsEndpoint {
    port: u16,
    path: String,
}

impl DevToolsEndpoint {
    fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}{}", self.port, self.path)
    }
}

/// Poll for the DevTools port file until the browser writes it or exits
async fn wait_for_devtools(child: &mut Child, profile_dir: &Path) -> Result<DevToolsEndpoint> {
    let port_file = profile_dir.join(DEVTOOLS_PORT_FILE);
    loop {
        if let Some(status) = child.try_wait()? {
            return Err(EngineError::LaunchFailed(format!(
                "browser exited during startup with {}",
                status
            )));
        }

        if let Ok(contents) = tokio::fs::read_to_string(&port_file).await {
            if let Some(endpoint) = parse_devtools_endpoint(&contents) {
                return Ok(endpoint);
            }
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// DevToolsActivePort holds the port, then the browser target path
fn parse_devtools_endpoint(contents: &str) -> Option<DevToolsEndpoint> {
    let mut lines = contents.lines();
    let port: u16 = lines.next()?.trim().parse().ok().filter(|port| *port != 0)?;
    let path = lines.next()?.trim();
    if !path.starts_with('/') {
        return None;
    }
    Some(DevToolsEndpoint {
        port,
        path: path.to_string(),
    })
}

async fn connect_devtools(ws_url: String) -> Result<Arc<Browser>> {
    debug!(url = %ws_url, "Connecting to DevTools");
    tokio::task::spawn_blocking(move || Browser::connect_with_timeout(ws_url, CDP_IDLE_TIMEOUT))
        .await
        .map_err(|e| EngineError::LaunchFailed(format!("DevTools connect task failed: {}", e)))?
        .map(Arc::new)
        .map_err(|e| EngineError::LaunchFailed(format!("cannot attach to DevTools: {:#}", e)))
}

/// Run a blocking CDP call off the async workers
async fn cdp_call<T, F>(what: &'static str, call: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| EngineError::Session(format!("{} task failed: {}", what, e)))?
        .map_err(|e| EngineError::Session(format!("{}: {:#}", what, e)))
}

/// Drain the browser's output and fire the disconnect signal when it exits
async fn watch_process(mut child: Child, notifier: Arc<DisconnectNotifier>) {
    let stderr = child.stderr.take().map(|stderr| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "solver_engine::browser::stderr", "{}", line);
            }
        })
    });
    let stdout = child.stdout.take().map(|stdout| {
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "solver_engine::browser::stdout", "{}", line);
            }
        })
    });

    match child.wait().await {
        Ok(status) => info!(%status, "Browser process exited"),
        Err(e) => warn!(error = %e, "Lost track of browser process"),
    }
    notifier.notify();

    for reader in [stderr, stdout].into_iter().flatten() {
        reader.abort();
    }
}

fn remove_profile(profile_dir: &Path) {
    if let Err(e) = std::fs::remove_dir_all(profile_dir) {
        debug!(error = %e, dir = ?profile_dir, "Could not remove browser profile");
    }
}

/// The OS side of a running browser
struct BrowserProcess {
    instance: String,
    pid: Option<u32>,
    endpoint: DevToolsEndpoint,
    profile_dir: PathBuf,
    process: Arc<ProcessManager>,
    notifier: Arc<DisconnectNotifier>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl BrowserProcess {
    /// Kill the browser, wait for the watcher and remove the profile
    async fn stop(&self) {
        if let Some(pid) = self.pid {
            if !self.notifier.is_disconnected() {
                if let Err(e) = self.process.kill(pid, CLOSE_GRACE).await {
                    warn!(pid, error = %e, "Error stopping browser");
                }
            }
        }

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            if tokio::time::timeout(CLOSE_GRACE, watcher).await.is_err() {
                warn!(pid = ?self.pid, "Browser watcher did not finish");
            }
        }

        remove_profile(&self.profile_dir);
    }
}

impl Drop for BrowserProcess {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            // The child is kill_on_drop; aborting the watcher drops it
            watcher.abort();
        }
    }
}

/// A running browser with a CDP connection
pub struct BrowserEngine {
    process: BrowserProcess,
    cdp: Arc<Browser>,
    closed: AtomicBool,
}

impl BrowserEngine {
    /// DevTools endpoint of the browser
    pub fn debugging_url(&self) -> String {
        self.process.endpoint.ws_url()
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid
    }
}

#[async_trait]
impl AutomationEngine for BrowserEngine {
    async fn create_session(&self) -> Result<Box<dyn EngineSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::EngineUnavailable("browser is closed".into()));
        }
        if self.process.notifier.is_disconnected() {
            return Err(EngineError::EngineCrashed(format!(
                "browser {} exited",
                self.process.instance
            )));
        }

        let browser = Arc::clone(&self.cdp);
        let context_id = cdp_call("create browser context", move || {
            let context = browser.new_context()?;
            Ok(context.get_id().to_string())
        })
        .await?;

        debug!(context = %context_id, "Browser context created");
        Ok(Box::new(BrowserSession {
            browser: Arc::clone(&self.cdp),
            context_id,
            engine_alive: self.process.notifier.subscribe(),
            closed: AtomicBool::new(false),
        }))
    }

    fn disconnect_signal(&self) -> DisconnectSignal {
        self.process.notifier.subscribe()
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.process.stop().await;
        info!(instance = %self.process.instance, "Browser closed");
        Ok(())
    }
}

/// A browser context
///
/// Solvers reach it through `WorkerSession::context::<BrowserSession>()` and
/// open pages with [`BrowserSession::new_page`].
pub struct BrowserSession {
    browser: Arc<Browser>,
    context_id: String,
    engine_alive: DisconnectSignal,
    closed: AtomicBool,
}

impl BrowserSession {
    /// Open a blank page inside this context
    pub async fn new_page(&self) -> Result<Arc<Tab>> {
        self.ensure_open()?;
        let browser = Arc::clone(&self.browser);
        let context_id = self.context_id.clone();
        cdp_call("open page", move || Context::new(&browser, context_id).new_tab()).await
    }

    /// Pages currently open in this context
    pub async fn pages(&self) -> Result<Vec<Arc<Tab>>> {
        self.ensure_open()?;
        let browser = Arc::clone(&self.browser);
        let context_id = self.context_id.clone();
        cdp_call("list pages", move || Context::new(&browser, context_id).get_tabs()).await
    }

    /// The browser this context lives in
    pub fn browser(&self) -> &Arc<Browser> {
        &self.browser
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Session(format!("context {} is closed", self.context_id)));
        }
        if self.engine_alive.is_disconnected() {
            return Err(EngineError::EngineCrashed(format!(
                "browser of context {} exited",
                self.context_id
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EngineSession for BrowserSession {
    fn handle(&self) -> &str {
        &self.context_id
    }

    async fn reset(&self) -> Result<()> {
        let pages = self.pages().await?;
        if pages.is_empty() {
            return Ok(());
        }

        let count = pages.len();
        cdp_call("close pages", move || {
            for page in pages {
                page.close(false)?;
            }
            Ok(())
        })
        .await?;
        debug!(context = %self.context_id, closed = count, "Context reset");
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        // The whole context went with the browser
        if self.engine_alive.is_disconnected() {
            return Ok(());
        }

        let browser = Arc::clone(&self.browser);
        let browser_context_id = self.context_id.clone();
        cdp_call("dispose browser context", move || {
            browser.call_method(Target::DisposeBrowserContext { browser_context_id })?;
            Ok(())
        })
        .await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn section() -> EngineSection {
        EngineSection {
            width: 800,
            height: 600,
            headless: true,
            extra_args: vec!["--lang=en-US".into()],
            ..Default::default()
        }
    }

    /// A fake browser: writes the port file into its profile and sleeps
    fn fake_browser(dir: &Path, script: &str) -> PathBuf {
        let path = dir.join("fake-browser");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Announces `port` without serving DevTools on it
    fn writes_port(port: u16) -> String {
        format!(
            r#"#!/bin/sh
for arg in "$@"; do
  case "$arg" in
    --user-data-dir=*) dir="${{arg#--user-data-dir=}}" ;;
  esac
done
printf '{}\n/devtools/browser/fake\n' > "$dir/DevToolsActivePort"
exec sleep 30
"#,
            port
        )
    }

    /// A local port nothing listens on
    fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn launcher_for(dir: &Path, script: &str) -> BrowserLauncher {
        let executable = fake_browser(dir, script);
        BrowserLauncher::new(EngineSection {
            executable: Some(executable.display().to_string()),
            ..section()
        })
    }

    #[test]
    fn test_launch_args() {
        let launcher = BrowserLauncher::new(section());
        let args = launcher.launch_args(Path::new("/tmp/profile"));

        assert_eq!(args[0], "--window-size=800,600");
        assert!(args.contains(&"--user-data-dir=/tmp/profile".to_string()));
        assert!(args.contains(&"--remote-debugging-port=0".to_string()));
        assert!(args.contains(&"--headless=new".to_string()));
        assert!(args.contains(&"--lang=en-US".to_string()));
        assert_eq!(args.last().unwrap(), "about:blank");
    }

    #[test]
    fn test_headful_by_default() {
        let launcher = BrowserLauncher::new(EngineSection::default());
        let args = launcher.launch_args(Path::new("/tmp/profile"));
        assert!(!args.iter().any(|arg| arg.starts_with("--headless")));
        assert!(args.contains(&"--window-size=520,240".to_string()));
    }

    #[test]
    fn test_parse_devtools_endpoint() {
        let endpoint = parse_devtools_endpoint("9222\n/devtools/browser/abc\n").unwrap();
        assert_eq!(endpoint.port, 9222);
        assert_eq!(endpoint.ws_url(), "ws://127.0.0.1:9222/devtools/browser/abc");

        assert_eq!(parse_devtools_endpoint("0\n/devtools/browser/abc\n"), None);
        // Written in two steps; the path may not be there yet
        assert_eq!(parse_devtools_endpoint("9222\n"), None);
        assert_eq!(parse_devtools_endpoint(""), None);
    }

    #[tokio::test]
    async fn test_process_exit_fires_disconnect() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_for(dir.path(), &writes_port(9333));
        let process = launcher.start_process().await.unwrap();
        assert_eq!(process.endpoint.ws_url(), "ws://127.0.0.1:9333/devtools/browser/fake");

        let mut signal = process.notifier.subscribe();
        assert!(!signal.is_disconnected());

        // Crash the browser from outside
        let pid = nix::unistd::Pid::from_raw(process.pid.unwrap() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGKILL).unwrap();

        tokio::time::timeout(Duration::from_secs(10), signal.wait()).await.unwrap();
        process.stop().await;
    }

    #[tokio::test]
    async fn test_stop_removes_profile() {
        let dir = tempfile::tempdir().unwrap();
        let process = launcher_for(dir.path(), &writes_port(9333))
            .start_process()
            .await
            .unwrap();
        let profile_dir = process.profile_dir.clone();
        assert!(profile_dir.join(DEVTOOLS_PORT_FILE).exists());

        process.stop().await;
        process.stop().await;

        assert!(process.notifier.is_disconnected());
        assert!(!profile_dir.exists());
    }

    #[tokio::test]
    async fn test_launch_fails_when_browser_exits() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_for(dir.path(), "#!/bin/sh\nexit 3\n");

        let result = tokio::time::timeout(Duration::from_secs(10), launcher.launch()).await.unwrap();
        assert!(matches!(result, Err(EngineError::LaunchFailed(_))));
    }

    #[tokio::test]
    async fn test_launch_fails_without_devtools() {
        let dir = tempfile::tempdir().unwrap();
        let launcher = launcher_for(dir.path(), &writes_port(closed_port()));

        let result = tokio::time::timeout(Duration::from_secs(30), launcher.launch()).await.unwrap();
        assert!(matches!(result, Err(EngineError::LaunchFailed(_))));
    }

    /// Waits for CDP target events to catch up with closed pages
    async fn wait_for_pages(session: &BrowserSession, expected: usize) {
        for _ in 0..50 {
            if session.pages().await.unwrap().len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        panic!("context never reached {} pages", expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    #[ignore = "requires a Chromium binary"]
    async fn test_contexts_against_real_browser() {
        let engine = BrowserLauncher::new(EngineSection {
            headless: true,
            ..Default::default()
        })
        .launch_browser()
        .await
        .unwrap();

        let session = engine.create_session().await.unwrap();
        let context = session.as_any().downcast_ref::<BrowserSession>().unwrap();
        context.new_page().await.unwrap();
        context.new_page().await.unwrap();
        wait_for_pages(context, 2).await;

        session.reset().await.unwrap();
        wait_for_pages(context, 0).await;

        session.close().await.unwrap();
        assert!(session.reset().await.is_err());

        engine.close().await.unwrap();
        assert!(engine.create_session().await.is_err());
    }
}
