pub mod cdp;
mod discovery;
mod launcher;
pub mod page;
mod session;

pub use cdp::{CdpConnection, CdpEvent, TargetInfo};
pub use discovery::{discover_all_browsers, discover_browser, BrowserInfo, BrowserType};
pub use launcher::{wait_for_cdp, BrowserLauncher, LaunchedBrowser};
pub use page::{CdpPage, ElementSnapshot, ElementState, Page};
pub use session::{
    force_kill_automation_browsers, scan_debug_ports, stabilize, Session, SessionManager,
    SessionStatus, SessionTeardown,
};
