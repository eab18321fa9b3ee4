//! CAN-ID classification consumed by the router
//!
//! Rules come from a TOML file:
//!
//! ```toml
//! [[canid]]
//! id = "0x3E8"
//! action = "ignore"
//!
//! [[canid]]
//! id = "0x7E8"
//! action = "iso15765"
//! ```
//!
//! Without any `iso15765` entry every frame that is not ignored is offered to
//! the ISO-TP decoder. Without a file at all, [`AutoDetect`] keeps VW TP2.0
//! traffic away from it.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::frame::{CanMessage, CAN_MAX_ID};
use crate::vwtp20::{self, ChannelSetup};

/// How often the filter file's modification time is checked
pub const RELOAD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Wait after a detected change so the writer can finish
pub const RELOAD_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// The two questions the router asks about every frame
pub trait CanIdClassifier: Send + Sync {
    /// Frame is dropped before forwarding or decoding
    fn ignore(&self, msg: &CanMessage) -> bool;

    /// Frame is offered to the ISO15765 decoder
    fn is_iso15765(&self, msg: &CanMessage) -> bool;
}

/// Offers every frame to ISO15765
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl CanIdClassifier for AcceptAll {
    fn ignore(&self, _msg: &CanMessage) -> bool {
        false
    }

    fn is_iso15765(&self, _msg: &CanMessage) -> bool {
        true
    }
}

/// Classifier used when no filter file is configured
///
/// Ignores nothing and offers frames to ISO15765, except the VW TP2.0
/// broadcast range and the unicast pair announced by the last positive
/// channel setup. The pair is released on a new setup request or a
/// disconnect.
#[derive(Debug, Default)]
pub struct AutoDetect {
    channel: Mutex<Option<(u32, u32)>>,
}

impl AutoDetect {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tester and ECU CAN IDs currently held back from ISO15765
    pub fn vwtp20_channel(&self) -> Option<(u32, u32)> {
        *self.channel.lock()
    }
}

impl CanIdClassifier for AutoDetect {
    fn ignore(&self, _msg: &CanMessage) -> bool {
        false
    }

    fn is_iso15765(&self, msg: &CanMessage) -> bool {
        let mut channel = self.channel.lock();
        if let Some(setup) = vwtp20::channel_setup(msg) {
            match setup {
                ChannelSetup::Request => *channel = None,
                ChannelSetup::Accepted { tester_id, ecu_id } => {
                    debug!(
                        tester_id = format!("0x{:X}", tester_id),
                        ecu_id = format!("0x{:X}", ecu_id),
                        "Keeping VWTP2.0 channel away from ISO15765"
                    );
                    *channel = Some((tester_id, ecu_id));
                }
                ChannelSetup::Rejected => {}
            }
            return false;
        }

        match *channel {
            Some((tester_id, ecu_id)) if msg.id() == tester_id || msg.id() == ecu_id => {
                if vwtp20::is_disconnect(msg) {
                    *channel = None;
                }
                false
            }
            _ => true,
        }
    }
}

impl<T: CanIdClassifier + ?Sized> CanIdClassifier for Arc<T> {
    fn ignore(&self, msg: &CanMessage) -> bool {
        (**self).ignore(msg)
    }

    fn is_iso15765(&self, msg: &CanMessage) -> bool {
        (**self).is_iso15765(msg)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterFile {
    #[serde(default)]
    canid: Vec<CanIdEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CanIdEntry {
    id: String,
    action: FilterAction,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum FilterAction {
    Ignore,
    Iso15765,
}

/// Parse a hexadecimal CAN ID, with or without `0x`
pub fn parse_can_id(text: &str) -> Result<u32, CoreError> {
    let trimmed = text.trim();
    let digits = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);

    match u32::from_str_radix(digits, 16) {
        Ok(id) if id <= CAN_MAX_ID => Ok(id),
        _ => Err(CoreError::InvalidCanId(text.to_string())),
    }
}

/// One parsed rule set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterRules {
    ignored: BTreeSet<u32>,
    iso15765: BTreeSet<u32>,
}

impl FilterRules {
    /// Parse rules from TOML text; `path` only labels errors
    pub fn from_toml(text: &str, path: &Path) -> Result<Self, CoreError> {
        let file: FilterFile = toml::from_str(text).map_err(|e| CoreError::FilterParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let mut rules = Self::default();
        for entry in file.canid {
            let id = parse_can_id(&entry.id)?;
            match entry.action {
                FilterAction::Ignore => rules.ignored.insert(id),
                FilterAction::Iso15765 => rules.iso15765.insert(id),
            };
        }
        Ok(rules)
    }

    pub fn ignore_id(mut self, id: u32) -> Self {
        self.ignored.insert(id);
        self
    }

    pub fn iso15765_id(mut self, id: u32) -> Self {
        self.iso15765.insert(id);
        self
    }

    pub fn ignored(&self) -> impl Iterator<Item = u32> + '_ {
        self.ignored.iter().copied()
    }

    pub fn iso15765(&self) -> impl Iterator<Item = u32> + '_ {
        self.iso15765.iter().copied()
    }

    fn log_summary(&self, path: &Path) {
        let render = |ids: &BTreeSet<u32>| {
            ids.iter()
                .map(|id| format!("{:X}", id))
                .collect::<Vec<_>>()
                .join(" ")
        };
        info!(
            path = %path.display(),
            ignored = %render(&self.ignored),
            iso15765 = %render(&self.iso15765),
            "CAN ID filter loaded"
        );
    }
}

impl CanIdClassifier for FilterRules {
    fn ignore(&self, msg: &CanMessage) -> bool {
        self.ignored.contains(&msg.id())
    }

    fn is_iso15765(&self, msg: &CanMessage) -> bool {
        self.iso15765.is_empty() || self.iso15765.contains(&msg.id())
    }
}

/// File-backed classifier with hot reload
#[derive(Debug, Clone)]
pub struct CanIdFilter {
    path: PathBuf,
    rules: Arc<RwLock<FilterRules>>,
}

impl CanIdFilter {
    /// Load rules from `path`
    pub fn load(path: impl Into<PathBuf>) -> Result<Self, CoreError> {
        let path = path.into();
        let rules = read_rules(&path)?;
        rules.log_summary(&path);
        Ok(Self {
            path,
            rules: Arc::new(RwLock::new(rules)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of the active rules
    pub fn rules(&self) -> FilterRules {
        self.rules.read().clone()
    }

    /// Re-read the file; on failure the active rules stay in place
    pub fn reload(&self) -> Result<(), CoreError> {
        let rules = read_rules(&self.path)?;
        rules.log_summary(&self.path);
        *self.rules.write() = rules;
        Ok(())
    }

    /// Poll the file every `interval` and reload on modification
    pub fn spawn_reload_task(
        &self,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> JoinHandle<()> {
        let filter = self.clone();
        tokio::spawn(async move {
            let mut last_modified = modified_time(&filter.path).await;
            let mut ticker = tokio::time::interval(interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                let modified = modified_time(&filter.path).await;
                if modified.is_none() || modified == last_modified {
                    continue;
                }
                last_modified = modified;

                tokio::time::sleep(RELOAD_SETTLE_DELAY).await;
                info!(path = %filter.path.display(), "CAN ID file changed, reloading");
                if let Err(e) = filter.reload() {
                    warn!(error = %e, "Keeping previous CAN ID filter");
                }
            }
            debug!("CAN ID filter reload task stopped");
        })
    }
}

impl CanIdClassifier for CanIdFilter {
    fn ignore(&self, msg: &CanMessage) -> bool {
        self.rules.read().ignore(msg)
    }

    fn is_iso15765(&self, msg: &CanMessage) -> bool {
        self.rules.read().is_iso15765(msg)
    }
}

fn read_rules(path: &Path) -> Result<FilterRules, CoreError> {
    let text = std::fs::read_to_string(path).map_err(|source| CoreError::FilterIo {
        path: path.to_path_buf(),
        source,
    })?;
    FilterRules::from_toml(&text, path)
}

async fn modified_time(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn frame(id: u32) -> CanMessage {
        CanMessage::new(id, &[0x02, 0x10, 0x03], 0)
    }

    fn write_filter(file: &tempfile::NamedTempFile, text: &str) {
        file.as_file().set_len(0).unwrap();
        let mut handle = file.reopen().unwrap();
        handle.write_all(text.as_bytes()).unwrap();
        handle.flush().unwrap();
    }

    #[test]
    fn test_parse_can_id() {
        assert_eq!(parse_can_id("0x7E8").unwrap(), 0x7E8);
        assert_eq!(parse_can_id("7e8").unwrap(), 0x7E8);
        assert_eq!(parse_can_id(" 0X18DAF110 ").unwrap(), 0x18DA_F110);
        assert!(parse_can_id("0x2000_0000").is_err());
        assert!(parse_can_id("0x20000000").is_err());
        assert!(parse_can_id("engine").is_err());
        assert!(parse_can_id("").is_err());
    }

    #[test]
    fn test_accept_all() {
        assert!(!AcceptAll.ignore(&frame(0x123)));
        assert!(AcceptAll.is_iso15765(&frame(0x123)));
    }

    #[test]
    fn test_auto_detect_skips_vwtp20_channel() {
        let classifier = AutoDetect::new();
        assert!(classifier.is_iso15765(&frame(0x740)));

        let setup = CanMessage::new(0x201, &[0x00, 0xD0, 0x40, 0x07, 0x00, 0x03, 0x01], 0);
        assert!(!classifier.ignore(&setup));
        assert!(!classifier.is_iso15765(&setup));
        assert_eq!(classifier.vwtp20_channel(), Some((0x740, 0x300)));

        assert!(!classifier.is_iso15765(&CanMessage::new(0x740, &[0x10, 0x00, 0x02, 0x10, 0x89], 0)));
        assert!(!classifier.is_iso15765(&CanMessage::new(0x300, &[0xB1], 0)));
        assert!(classifier.is_iso15765(&frame(0x7E8)));

        // Short frames in the broadcast range are not channel setup
        assert!(classifier.is_iso15765(&CanMessage::new(0x2A0, &[0x02, 0x10], 0)));

        assert!(!classifier.is_iso15765(&CanMessage::new(0x300, &[0xA8], 0)));
        assert_eq!(classifier.vwtp20_channel(), None);
        assert!(classifier.is_iso15765(&frame(0x300)));
    }

    #[test]
    fn test_auto_detect_setup_request_releases_channel() {
        let classifier = AutoDetect::new();
        classifier.is_iso15765(&CanMessage::new(0x201, &[0x00, 0xD0, 0x40, 0x07, 0x00, 0x03, 0x01], 0));
        let request = CanMessage::new(0x200, &[0x01, 0xC0, 0x00, 0x10, 0x00, 0x03, 0x01], 0);
        assert!(!classifier.is_iso15765(&request));
        assert_eq!(classifier.vwtp20_channel(), None);
        assert!(classifier.is_iso15765(&frame(0x740)));
    }

    #[test]
    fn test_rules_from_toml() {
        let text = r#"
            [[canid]]
            id = "0x3E8"
            action = "ignore"

            [[canid]]
            id = "0x7E8"
            action = "iso15765"
        "#;
        let rules = FilterRules::from_toml(text, Path::new("test.toml")).unwrap();
        assert_eq!(rules.ignored().collect::<Vec<_>>(), vec![0x3E8]);
        assert!(rules.ignore(&frame(0x3E8)));
        assert!(!rules.ignore(&frame(0x7E8)));
        assert!(rules.is_iso15765(&frame(0x7E8)));
        assert!(!rules.is_iso15765(&frame(0x7E0)));
    }

    #[test]
    fn test_no_iso15765_entries_accepts_every_frame() {
        let rules = FilterRules::default().ignore_id(0x100);
        assert!(rules.is_iso15765(&frame(0x7E0)));
        assert!(rules.is_iso15765(&frame(0x300)));

        let empty = FilterRules::from_toml("", Path::new("empty.toml")).unwrap();
        assert_eq!(empty, FilterRules::default());
    }

    #[test]
    fn test_bad_rules_rejected() {
        let unknown_action = "[[canid]]\nid = \"0x7E8\"\naction = \"drop\"\n";
        assert!(matches!(
            FilterRules::from_toml(unknown_action, Path::new("f.toml")),
            Err(CoreError::FilterParse { .. })
        ));

        let bad_id = "[[canid]]\nid = \"0xZZ\"\naction = \"ignore\"\n";
        assert!(matches!(
            FilterRules::from_toml(bad_id, Path::new("f.toml")),
            Err(CoreError::InvalidCanId(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = CanIdFilter::load("/nonexistent/canids.toml").unwrap_err();
        assert!(matches!(err, CoreError::FilterIo { .. }));
    }

    #[test]
    fn test_failed_reload_keeps_rules() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_filter(&file, "[[canid]]\nid = \"0x3E8\"\naction = \"ignore\"\n");

        let filter = CanIdFilter::load(file.path()).unwrap();
        assert!(filter.ignore(&frame(0x3E8)));

        write_filter(&file, "[[canid]]\nid = \"0x3E8\"\naction = \"nope\"\n");
        assert!(filter.reload().is_err());
        assert!(filter.ignore(&frame(0x3E8)));

        write_filter(&file, "[[canid]]\nid = \"0x3E9\"\naction = \"ignore\"\n");
        filter.reload().unwrap();
        assert!(!filter.ignore(&frame(0x3E8)));
        assert!(filter.ignore(&frame(0x3E9)));
    }

    #[tokio::test]
    async fn test_reload_task_picks_up_changes() {
        let file = tempfile::NamedTempFile::new().unwrap();
        write_filter(&file, "[[canid]]\nid = \"0x3E8\"\naction = \"ignore\"\n");
        let filter = CanIdFilter::load(file.path()).unwrap();

        let running = Arc::new(AtomicBool::new(true));
        let handle = filter.spawn_reload_task(Duration::from_millis(10), running.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        write_filter(&file, "[[canid]]\nid = \"0x123\"\naction = \"ignore\"\n");
        // Guarantee a visible mtime change on coarse filesystems
        file.as_file()
            .set_modified(SystemTime::now() + Duration::from_secs(10))
            .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !filter.ignore(&frame(0x123)) {
            assert!(tokio::time::Instant::now() < deadline, "filter never reloaded");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!filter.ignore(&frame(0x3E8)));

        running.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("reload task did not stop")
            .expect("reload task panicked");
    }
}
