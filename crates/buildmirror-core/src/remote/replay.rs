//! Directory-backed CI server.
//!
//! Layout under the root directory:
//!
//! ```text
//! refs/page-1.json          RefPage, newest builds first
//! refs/page-<token>.json    page named by the previous page's `nextPage`
//! builds/<id>.json          BuildSnapshot
//! tests/<id>/page-1.json    TestPage, continued the same way
//! ```
//!
//! A missing `refs/` or `tests/<id>/` directory reads as one empty page.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::RemoteCiClient;
use crate::error::RemoteError;
use crate::model::{BuildRef, BuildSnapshot, BuildState, RefPage, TestPage};

const FIRST_PAGE: &str = "1";

/// Replays a captured server from a directory.
#[derive(Debug)]
pub struct DirRemote {
    server_id: String,
    root: PathBuf,
    /// Serializes `trigger_build` so concurrent triggers get distinct ids.
    trigger_lock: Mutex<()>,
}

impl DirRemote {
    #[must_use]
    pub fn new(server_id: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            server_id: server_id.into(),
            root: root.into(),
            trigger_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn refs_page_path(&self, token: &str) -> PathBuf {
        self.root.join("refs").join(format!("page-{token}.json"))
    }

    fn build_path(&self, id: u32) -> PathBuf {
        self.root.join("builds").join(format!("{id}.json"))
    }

    fn tests_page_path(&self, id: u32, token: &str) -> PathBuf {
        self.root
            .join("tests")
            .join(id.to_string())
            .join(format!("page-{token}.json"))
    }

    /// Highest build id present under `builds/`.
    fn max_build_id(&self) -> Result<u32, RemoteError> {
        let dir = self.root.join("builds");
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(io_error(&dir, &e)),
        };
        Ok(entries
            .filter_map(Result::ok)
            .filter_map(|e| {
                e.path()
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0))
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> RemoteError {
    RemoteError::Transient(format!("{}: {err}", path.display()))
}

/// Read and decode one JSON file; `Ok(None)` when it does not exist.
fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, RemoteError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path, &e)),
    };
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|e| RemoteError::Malformed(format!("{}: {e}", path.display())))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), RemoteError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| io_error(parent, &e))?;
    }
    let raw = serde_json::to_string_pretty(value)
        .map_err(|e| RemoteError::Malformed(format!("{}: {e}", path.display())))?;
    fs::write(path, raw).map_err(|e| io_error(path, &e))
}

impl RemoteCiClient for DirRemote {
    fn server_id(&self) -> &str {
        &self.server_id
    }

    fn get_build_refs(&self, page: Option<&str>) -> Result<RefPage, RemoteError> {
        let token = page.unwrap_or(FIRST_PAGE);
        let path = self.refs_page_path(token);
        match read_json(&path)? {
            Some(found) => Ok(found),
            None if page.is_none() => Ok(RefPage::default()),
            None => Err(RemoteError::NotFound(format!("refs page {token}"))),
        }
    }

    fn get_build(&self, id: u32) -> Result<BuildSnapshot, RemoteError> {
        read_json(&self.build_path(id))?
            .ok_or_else(|| RemoteError::NotFound(format!("build {id}")))
    }

    fn get_tests_page(
        &self,
        build_id: u32,
        page: Option<&str>,
        with_details: bool,
    ) -> Result<TestPage, RemoteError> {
        let token = page.unwrap_or(FIRST_PAGE);
        let mut found: TestPage = match read_json(&self.tests_page_path(build_id, token))? {
            Some(found) => found,
            None if page.is_none() => TestPage::default(),
            None => {
                return Err(RemoteError::NotFound(format!(
                    "tests page {token} of build {build_id}"
                )));
            }
        };
        if !with_details {
            for test in &mut found.tests {
                test.details = None;
            }
        }
        Ok(found)
    }

    fn trigger_build(
        &self,
        build_type_id: &str,
        branch: &str,
        clean_rebuild: bool,
        queue_at_top: bool,
    ) -> Result<BuildSnapshot, RemoteError> {
        let _guard = self
            .trigger_lock
            .lock()
            .map_err(|_| RemoteError::Transient("replay trigger lock poisoned".into()))?;

        let mut build = BuildSnapshot::fake_stub(self.max_build_id()?.saturating_add(1));
        build.fake_stub = false;
        build.build_type_id = build_type_id.to_string();
        build.branch_name = Some(branch.to_string());
        build.status = None;
        build.state = BuildState::Queued;
        write_json(&self.build_path(build.id), &build)?;

        let first = self.refs_page_path(FIRST_PAGE);
        let mut page: RefPage = read_json(&first)?.unwrap_or_default();
        let new_ref: BuildRef = build.to_ref();
        page.refs.insert(0, new_ref);
        write_json(&first, &page)?;

        tracing::info!(
            server = %self.server_id,
            build = build.id,
            build_type_id,
            branch,
            clean_rebuild,
            queue_at_top,
            "replay build triggered"
        );
        Ok(build)
    }
}

#[cfg(test)]
mod tests {
    use super::DirRemote;
    use crate::error::RemoteError;
    use crate::model::BuildState;
    use crate::remote::{RemoteCiClient, fetch_all_test_pages};
    use std::fs;

    fn write(root: &std::path::Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, body).expect("write");
    }

    #[test]
    fn pages_follow_next_page_tokens() {
        let dir = tempfile::tempdir().expect("temp dir");
        write(
            dir.path(),
            "refs/page-1.json",
            r#"{"refs":[{"id":2,"buildTypeId":"bt","state":"running"}],"nextPage":"2"}"#,
        );
        write(
            dir.path(),
            "refs/page-2.json",
            r#"{"refs":[{"id":1,"buildTypeId":"bt","state":"finished"}]}"#,
        );
        let remote = DirRemote::new("apache", dir.path());

        let first = remote.get_build_refs(None).expect("first page");
        assert_eq!(first.next_page.as_deref(), Some("2"));
        let second = remote.get_build_refs(first.next_page.as_deref()).expect("second page");
        assert_eq!(second.refs[0].id, 1);
        assert!(second.next_page.is_none());
    }

    #[test]
    fn missing_build_is_not_found_and_bad_json_is_malformed() {
        let dir = tempfile::tempdir().expect("temp dir");
        write(dir.path(), "builds/5.json", "{ nope");
        let remote = DirRemote::new("apache", dir.path());

        assert!(remote.get_build(4).expect_err("absent").is_not_found());
        assert!(matches!(remote.get_build(5), Err(RemoteError::Malformed(_))));
        assert!(remote.get_build_refs(None).expect("empty").refs.is_empty());
    }

    #[test]
    fn test_details_are_stripped_unless_requested() {
        let dir = tempfile::tempdir().expect("temp dir");
        write(
            dir.path(),
            "tests/7/page-1.json",
            r#"{"tests":[{"id":"id:1","name":"t","status":"FAILURE","details":"boom"}],"nextPage":"2"}"#,
        );
        write(dir.path(), "tests/7/page-2.json", r#"{"tests":[]}"#);
        let remote = DirRemote::new("apache", dir.path());

        let pages = fetch_all_test_pages(&remote, 7, false).expect("pages");
        assert_eq!(pages.len(), 2);
        assert!(pages[0].tests[0].details.is_none());
        let detailed = remote.get_tests_page(7, None, true).expect("page");
        assert_eq!(detailed.tests[0].details.as_deref(), Some("boom"));
    }

    #[test]
    fn trigger_allocates_next_id_and_lists_it_first() {
        let dir = tempfile::tempdir().expect("temp dir");
        write(
            dir.path(),
            "builds/9.json",
            r#"{"id":9,"buildTypeId":"bt","state":"finished"}"#,
        );
        let remote = DirRemote::new("apache", dir.path());

        let queued = remote
            .trigger_build("bt", "refs/heads/master", false, true)
            .expect("trigger");
        assert_eq!(queued.id, 10);
        assert_eq!(queued.state, BuildState::Queued);
        assert_eq!(remote.get_build(10).expect("stored").id, 10);
        assert_eq!(remote.get_build_refs(None).expect("page").refs[0].id, 10);
    }
}
