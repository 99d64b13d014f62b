//! Membership directory for lumberjack
//!
//! A lodge is where lumberjacks check in. One node hosts the authoritative
//! lodge; every other node mirrors it, pushing its own check-in on a timer and
//! fetching the directory whenever it is read.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use lumberjack_types::{Fellow, WireError};

/// Timeout for check-in and directory requests against the authority
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LodgeError {
    #[error("fellow {0} tried to check in past curfew")]
    PastCurfew(String),

    #[error("this lodge mirrors {0} and does not accept check-ins")]
    NotAuthoritative(String),

    #[error("invalid check-in: {0}")]
    Wire(#[from] WireError),

    #[error("lodge request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("lodge answered {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Outcome of an accepted check-in
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckIn {
    /// First time this name was seen
    Joined,
    /// Known fellow, timestamp refreshed
    Renewed,
}

/// Every fellow the lodge knows about, dead or alive
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Directory {
    pub fellows: Vec<Fellow>,
}

enum LodgeMode {
    Authoritative,
    Mirror {
        /// `host:port` of the authoritative lodge
        authority: String,
        client: reqwest::Client,
    },
}

/// Where all the lumberjacks check in
pub struct Lodge {
    /// Name of the local fellow, always present in `fellows`
    me: String,

    fellows: RwLock<HashMap<String, Fellow>>,

    mode: LodgeMode,

    /// Successful check-ins of the local fellow
    check_ins: AtomicU64,
}

impl Lodge {
    /// Host the directory on this node
    pub fn authoritative(me: Fellow) -> Self {
        Self::with_mode(me, LodgeMode::Authoritative)
    }

    /// Mirror the directory hosted at `authority` (`host:port`)
    pub fn mirror(me: Fellow, authority: impl Into<String>) -> Result<Self, LodgeError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self::with_mode(
            me,
            LodgeMode::Mirror {
                authority: authority.into(),
                client,
            },
        ))
    }

    /// Authoritative without an authority address, mirror with one
    pub fn new(me: Fellow, authority: Option<String>) -> Result<Self, LodgeError> {
        match authority {
            Some(authority) => Self::mirror(me, authority),
            None => Ok(Self::authoritative(me)),
        }
    }

    fn with_mode(me: Fellow, mode: LodgeMode) -> Self {
        let name = me.name.clone();
        let mut fellows = HashMap::new();
        fellows.insert(name.clone(), me);

        Self {
            me: name,
            fellows: RwLock::new(fellows),
            mode,
            check_ins: AtomicU64::new(0),
        }
    }

    pub fn is_authoritative(&self) -> bool {
        matches!(self.mode, LodgeMode::Authoritative)
    }

    /// Address of the authority this lodge mirrors
    pub fn authority(&self) -> Option<&str> {
        match &self.mode {
            LodgeMode::Authoritative => None,
            LodgeMode::Mirror { authority, .. } => Some(authority),
        }
    }

    /// The local fellow's current record
    pub fn local(&self) -> Fellow {
        self.stamp_local(None)
    }

    /// Read the local record, stamping it first when `at` is given
    fn stamp_local(&self, at: Option<DateTime<Utc>>) -> Fellow {
        let mut fellows = self.fellows.write();
        let me = fellows
            .entry(self.me.clone())
            .or_insert_with(|| Fellow::new(self.me.clone()));
        if let Some(at) = at {
            me.last_checked_in = at;
        }
        me.clone()
    }

    pub fn check_in_locally(&self) {
        self.stamp_local(Some(Utc::now()));
        debug!(fellow = %self.me, "Locally posted check-in");
    }

    /// Stamp the local fellow and post it to the authority
    ///
    /// A non-200 answer is reported as [`LodgeError::Rejected`]; the next
    /// periodic tick is the only retry.
    pub async fn check_in_remotely(&self) -> Result<(), LodgeError> {
        let LodgeMode::Mirror { authority, client } = &self.mode else {
            self.check_in_locally();
            return Ok(());
        };

        let body = self.stamp_local(Some(Utc::now())).to_json()?;
        debug!(body = %body, "Posting check-in");

        let response = client
            .post(format!("http://{}/lodge", authority))
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if status == reqwest::StatusCode::OK {
            debug!(status = status.as_u16(), "Posted check-in");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(LodgeError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    /// Check in the way this lodge's mode requires
    pub async fn check_in(&self) -> Result<(), LodgeError> {
        if self.is_authoritative() {
            self.check_in_locally();
        } else {
            self.check_in_remotely().await?;
        }
        self.check_ins.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of successful check-ins through [`Lodge::check_in`]
    pub fn check_in_count(&self) -> u64 {
        self.check_ins.load(Ordering::Relaxed)
    }

    /// Check in now and then every `curfew - 10s` until cancelled
    pub fn spawn_check_ins(self: &Arc<Self>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let lodge = Arc::clone(self);
        let period = lodge.local().check_in_interval();
        info!(
            fellow = %lodge.me,
            period_secs = period.as_secs(),
            authoritative = lodge.is_authoritative(),
            "Starting check-ins"
        );

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,

                    _ = ticker.tick() => {
                        if let Err(e) = lodge.check_in().await {
                            error!(error = %e, "Failed to post check-in");
                        }
                    }
                }
            }
        })
    }

    /// Accept a check-in announced by another fellow
    ///
    /// Records already past their curfew are refused so that a node cannot
    /// resurrect itself with a stale timestamp. A known fellow only has its
    /// timestamp refreshed; its announced files are kept as first seen.
    pub fn receive_check_in(&self, fellow: Fellow) -> Result<CheckIn, LodgeError> {
        if let LodgeMode::Mirror { authority, .. } = &self.mode {
            return Err(LodgeError::NotAuthoritative(authority.clone()));
        }

        if !fellow.alive() {
            warn!(fellow = %fellow.name, "Fellow tried to check in past curfew. Denied.");
            return Err(LodgeError::PastCurfew(fellow.name));
        }

        let mut fellows = self.fellows.write();
        match fellows.get_mut(&fellow.name) {
            Some(known) => {
                known.last_checked_in = fellow.last_checked_in;
                debug!(fellow = %fellow.name, "Fellow checked in");
                Ok(CheckIn::Renewed)
            }
            None => {
                info!(fellow = %fellow.name, files = fellow.lumberfiles.len(), "Fellow joined");
                fellows.insert(fellow.name.clone(), fellow);
                Ok(CheckIn::Joined)
            }
        }
    }

    /// Decode a check-in body and accept it
    pub fn receive_check_in_json(&self, body: &[u8]) -> Result<CheckIn, LodgeError> {
        let fellow = Fellow::from_json(body)?;
        self.receive_check_in(fellow)
    }

    /// Every known fellow as held locally, sorted by name
    pub fn directory(&self) -> Directory {
        let mut fellows: Vec<Fellow> = self.fellows.read().values().cloned().collect();
        fellows.sort_by(|a, b| a.name.cmp(&b.name));
        Directory { fellows }
    }

    /// Every known fellow, dead or alive, sorted by name
    ///
    /// A mirror re-synchronizes from its authority first.
    pub async fn full_directory(&self) -> Result<Directory, LodgeError> {
        self.sync().await?;
        Ok(self.directory())
    }

    /// Fellows that are still within their curfew, sorted by name
    ///
    /// A mirror re-synchronizes from its authority first.
    pub async fn alive_lumberjacks(&self) -> Result<Vec<Fellow>, LodgeError> {
        self.sync().await?;

        let now = Utc::now();
        Ok(self
            .directory()
            .fellows
            .into_iter()
            .filter(|fellow| fellow.alive_at(now))
            .collect())
    }

    async fn sync(&self) -> Result<(), LodgeError> {
        if let LodgeMode::Mirror { authority, client } = &self.mode {
            let directory = Self::fetch_directory(client, authority).await?;
            self.replace_fellows(directory);
        }
        Ok(())
    }

    async fn fetch_directory(client: &reqwest::Client, authority: &str) -> Result<Directory, LodgeError> {
        let response = client
            .get(format!("http://{}/lodge", authority))
            .header(ACCEPT, "application/json")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LodgeError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<Directory>().await?)
    }

    /// Take the authority's view, keeping our own record
    fn replace_fellows(&self, directory: Directory) {
        let mut fellows = self.fellows.write();
        let me = fellows.remove(&self.me);

        fellows.clear();
        for fellow in directory.fellows {
            fellows.insert(fellow.name.clone(), fellow);
        }
        if let Some(me) = me {
            fellows.insert(self.me.clone(), me);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use lumberjack_types::Lumberfile;

    fn names(fellows: &[Fellow]) -> Vec<&str> {
        fellows.iter().map(|f| f.name.as_str()).collect()
    }

    #[tokio::test]
    async fn test_authority_starts_with_itself() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));

        assert!(lodge.is_authoritative());
        assert_eq!(lodge.authority(), None);
        assert_eq!(names(&lodge.alive_lumberjacks().await.unwrap()), ["lodge"]);
    }

    #[tokio::test]
    async fn test_new_fellow_joins() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        let outcome = lodge.receive_check_in(Fellow::new("cedar")).unwrap();

        assert_eq!(outcome, CheckIn::Joined);
        assert_eq!(names(&lodge.alive_lumberjacks().await.unwrap()), ["cedar", "lodge"]);
    }

    #[test]
    fn test_known_fellow_only_refreshes_timestamp() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        let first = Fellow::new("cedar").with_lumberfiles(vec![Lumberfile::new("a.log")]);
        lodge.receive_check_in(first).unwrap();

        let mut second = Fellow::new("cedar").with_lumberfiles(vec![Lumberfile::new("b.log")]);
        second.last_checked_in = Utc::now() + TimeDelta::seconds(1);
        let stamp = second.last_checked_in;

        assert_eq!(lodge.receive_check_in(second).unwrap(), CheckIn::Renewed);

        let directory = lodge.directory();
        let cedar = directory.fellows.iter().find(|f| f.name == "cedar").unwrap();
        assert_eq!(cedar.last_checked_in, stamp);
        assert_eq!(cedar.lumberfiles, vec![Lumberfile::new("a.log")]);
    }

    #[test]
    fn test_stale_check_in_is_rejected() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        let before = lodge.directory().fellows;

        let mut stale = Fellow::new("ghost").with_curfew(Duration::from_secs(60));
        stale.last_checked_in = Utc::now() - TimeDelta::seconds(60);

        let result = lodge.receive_check_in(stale);
        assert!(matches!(result, Err(LodgeError::PastCurfew(name)) if name == "ghost"));
        assert_eq!(lodge.directory().fellows, before);
    }

    #[test]
    fn test_check_in_json() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        let body = Fellow::new("pine").to_json().unwrap();

        assert_eq!(lodge.receive_check_in_json(body.as_bytes()).unwrap(), CheckIn::Joined);
        assert!(matches!(
            lodge.receive_check_in_json(b"{not json"),
            Err(LodgeError::Wire(_))
        ));
    }

    #[tokio::test]
    async fn test_dead_fellows_stay_in_directory() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        lodge
            .receive_check_in(Fellow::new("short").with_curfew(Duration::from_millis(50)))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(names(&lodge.directory().fellows), ["lodge", "short"]);
        assert_eq!(names(&lodge.alive_lumberjacks().await.unwrap()), ["lodge"]);
    }

    #[test]
    fn test_check_in_locally_stamps_local_fellow() {
        let mut me = Fellow::new("lodge");
        me.last_checked_in = Utc::now() - TimeDelta::minutes(5);
        let lodge = Lodge::authoritative(me.clone());

        lodge.check_in_locally();
        assert!(lodge.local().last_checked_in > me.last_checked_in);
    }

    #[test]
    fn test_mirror_refuses_check_ins() {
        let lodge = Lodge::mirror(Fellow::new("leaf"), "lodge.internal:8080").unwrap();

        assert!(!lodge.is_authoritative());
        assert_eq!(lodge.authority(), Some("lodge.internal:8080"));
        assert!(matches!(
            lodge.receive_check_in(Fellow::new("other")),
            Err(LodgeError::NotAuthoritative(_))
        ));
    }

    #[tokio::test]
    async fn test_full_directory_on_authority_is_local() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        lodge.receive_check_in(Fellow::new("cedar")).unwrap();

        let directory = lodge.full_directory().await.unwrap();
        assert_eq!(names(&directory.fellows), ["cedar", "lodge"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_ins_tick_until_cancelled() {
        // 70s curfew leaves a 60s period
        let me = Fellow::new("lodge").with_curfew(Duration::from_secs(70));
        let lodge = Arc::new(Lodge::authoritative(me));
        let cancel = CancellationToken::new();
        let task = lodge.spawn_check_ins(cancel.clone());

        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lodge.check_in_count(), 1);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert_eq!(lodge.check_in_count(), 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(lodge.check_in_count(), 2);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lodge.check_in_count(), 3);

        cancel.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(lodge.check_in_count(), 3);
    }

    #[test]
    fn test_directory_wire_format() {
        let lodge = Lodge::authoritative(Fellow::new("lodge"));
        let json = serde_json::to_value(lodge.directory()).unwrap();

        assert_eq!(json["fellows"][0]["name"], "lodge");
        assert_eq!(json["fellows"][0]["curfew"], 1200);
    }
}
