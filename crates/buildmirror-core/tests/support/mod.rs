//! Scripted CI server shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use buildmirror_core::RemoteError;
use buildmirror_core::config::SyncConfig;
use buildmirror_core::model::{
    BuildRef, BuildSnapshot, BuildState, RefPage, TestOccurrence, TestPage,
};
use buildmirror_core::remote::RemoteCiClient;
use buildmirror_core::scheduler::ManualScheduler;
use buildmirror_core::store::Stores;
use buildmirror_core::sync::SyncOrchestrator;

pub const SERVER: &str = "apache";

#[derive(Default)]
struct Script {
    /// Page `i` is served for token `i` (`None` is page 0).
    pages: Vec<Vec<BuildRef>>,
    builds: HashMap<u32, BuildSnapshot>,
    tests: HashMap<u32, Vec<TestPage>>,
    failing: HashSet<u32>,
    /// Serving this page index fails with a transient error.
    failing_page: Option<usize>,
    next_trigger_id: u32,
}

/// In-memory server whose content tests edit between calls.
#[derive(Default)]
pub struct ScriptedRemote {
    script: Mutex<Script>,
    pub build_calls: Mutex<Vec<u32>>,
    pub page_calls: Mutex<usize>,
    /// `(build_id, with_details)` for every test page served.
    pub test_calls: Mutex<Vec<(u32, bool)>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_pages(&self, pages: Vec<Vec<BuildRef>>) {
        self.script.lock().expect("script").pages = pages;
    }

    pub fn put_build(&self, build: BuildSnapshot, tests: Vec<TestPage>) {
        let mut script = self.script.lock().expect("script");
        script.tests.insert(build.id, tests);
        script.builds.insert(build.id, build);
    }

    pub fn forget_build(&self, id: u32) {
        let mut script = self.script.lock().expect("script");
        script.builds.remove(&id);
        script.tests.remove(&id);
    }

    /// Make `get_build(id)` fail with a transient error.
    pub fn fail_build(&self, id: u32) {
        self.script.lock().expect("script").failing.insert(id);
    }

    /// Make the history page at `idx` fail with a transient error.
    pub fn fail_page(&self, idx: usize) {
        self.script.lock().expect("script").failing_page = Some(idx);
    }

    pub fn fetched_builds(&self) -> Vec<u32> {
        let mut calls = self.build_calls.lock().expect("calls").clone();
        calls.sort_unstable();
        calls
    }

    /// Distinct `with_details` flags requested for `build_id`'s tests.
    pub fn details_requested(&self, build_id: u32) -> Vec<bool> {
        let mut flags: Vec<bool> = self
            .test_calls
            .lock()
            .expect("calls")
            .iter()
            .filter(|(id, _)| *id == build_id)
            .map(|(_, details)| *details)
            .collect();
        flags.dedup();
        flags
    }

    pub fn pages_served(&self) -> usize {
        *self.page_calls.lock().expect("calls")
    }
}

impl RemoteCiClient for ScriptedRemote {
    fn server_id(&self) -> &str {
        SERVER
    }

    fn get_build_refs(&self, page: Option<&str>) -> Result<RefPage, RemoteError> {
        *self.page_calls.lock().expect("calls") += 1;
        let script = self.script.lock().expect("script");
        let idx: usize = match page {
            None => 0,
            Some(token) => token
                .parse()
                .map_err(|_| RemoteError::Malformed(format!("page token {token}")))?,
        };
        if script.failing_page == Some(idx) {
            return Err(RemoteError::Transient(format!("refs page {idx}: 502 bad gateway")));
        }
        let refs = script.pages.get(idx).cloned().unwrap_or_default();
        let next_page = (idx + 1 < script.pages.len()).then(|| (idx + 1).to_string());
        Ok(RefPage { refs, next_page })
    }

    fn get_build(&self, id: u32) -> Result<BuildSnapshot, RemoteError> {
        self.build_calls.lock().expect("calls").push(id);
        let script = self.script.lock().expect("script");
        if script.failing.contains(&id) {
            return Err(RemoteError::Transient(format!("build {id}: connection reset")));
        }
        script
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("build {id}")))
    }

    fn get_tests_page(
        &self,
        build_id: u32,
        page: Option<&str>,
        with_details: bool,
    ) -> Result<TestPage, RemoteError> {
        self.test_calls
            .lock()
            .expect("calls")
            .push((build_id, with_details));
        let script = self.script.lock().expect("script");
        let idx: usize = page.and_then(|p| p.parse().ok()).unwrap_or(0);
        let pages = script.tests.get(&build_id).cloned().unwrap_or_default();
        let mut found = pages.get(idx).cloned().unwrap_or_default();
        found.next_page = (idx + 1 < pages.len()).then(|| (idx + 1).to_string());
        Ok(found)
    }

    fn trigger_build(
        &self,
        build_type_id: &str,
        branch: &str,
        _clean_rebuild: bool,
        _queue_at_top: bool,
    ) -> Result<BuildSnapshot, RemoteError> {
        let mut script = self.script.lock().expect("script");
        script.next_trigger_id += 1;
        let id = 90_000 + script.next_trigger_id;
        let mut build = snapshot(id, build_type_id, BuildState::Queued);
        build.branch_name = Some(branch.to_string());
        build.status = None;
        if script.pages.is_empty() {
            script.pages.push(Vec::new());
        }
        script.pages[0].insert(0, build.to_ref());
        script.builds.insert(id, build.clone());
        Ok(build)
    }
}

pub fn build_ref(id: u32, state: BuildState) -> BuildRef {
    BuildRef {
        id,
        build_type_id: "Ignite_Cache1".into(),
        branch_name: Some("refs/heads/master".into()),
        status: Some("SUCCESS".into()),
        state,
    }
}

pub fn snapshot(id: u32, build_type_id: &str, state: BuildState) -> BuildSnapshot {
    let mut build = BuildSnapshot::fake_stub(id);
    build.fake_stub = false;
    build.build_type_id = build_type_id.into();
    build.branch_name = Some("refs/heads/master".into());
    build.status = Some("SUCCESS".into());
    build.state = state;
    build.start_date = Some(1_700_000_000_000);
    if state == BuildState::Finished {
        build.finish_date = Some(1_700_000_600_000);
    }
    build
}

pub fn test_page(names: &[(&str, &str)]) -> TestPage {
    TestPage {
        tests: names
            .iter()
            .enumerate()
            .map(|(idx, (name, status))| TestOccurrence {
                id: format!("id:{}", idx + 1),
                name: (*name).to_string(),
                status: (*status).to_string(),
                duration: Some(10),
                ignored: false,
                muted: false,
                currently_investigated: false,
                test_id: None,
                details: None,
            })
            .collect(),
        next_page: None,
    }
}

pub struct Harness {
    pub remote: Arc<ScriptedRemote>,
    pub scheduler: Arc<ManualScheduler>,
    pub stores: Arc<Stores>,
    pub sync: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn in_memory() -> Self {
        Self::with_stores(Stores::in_memory(), SyncConfig::default())
    }

    pub fn with_stores(stores: Stores, config: SyncConfig) -> Self {
        let remote = ScriptedRemote::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let stores = Arc::new(stores);
        let sync = SyncOrchestrator::new(
            remote.clone(),
            Arc::clone(&stores),
            scheduler.clone(),
            config,
        );
        Self {
            remote,
            scheduler,
            stores,
            sync,
        }
    }

    /// Run every pending proactive load.
    pub fn drain_loads(&self) -> usize {
        self.scheduler.run_named_with_prefix("loadFatBuilds")
    }
}
