//! Access to a CI server's build history.
//!
//! The mirror only ever pages; it never asks the server for a filtered
//! view. [`replay::DirRemote`] serves a captured server from disk.

pub mod replay;

pub use replay::DirRemote;

use crate::error::RemoteError;
use crate::model::{BuildSnapshot, RefPage, TestPage};

/// A paginated CI server.
pub trait RemoteCiClient: Send + Sync {
    /// Stable server identifier; also the source of the server mask.
    fn server_id(&self) -> &str;

    /// One page of build references, newest first. `None` asks for the
    /// first page.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the page cannot be fetched.
    fn get_build_refs(&self, page: Option<&str>) -> Result<RefPage, RemoteError>;

    /// Full snapshot of one build.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::NotFound`] if the server does not know `id`.
    fn get_build(&self, id: u32) -> Result<BuildSnapshot, RemoteError>;

    /// One page of test occurrences. Failure details are requested only
    /// when `with_details` is set.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the page cannot be fetched.
    fn get_tests_page(
        &self,
        build_id: u32,
        page: Option<&str>,
        with_details: bool,
    ) -> Result<TestPage, RemoteError>;

    /// Queue a new build.
    ///
    /// # Errors
    ///
    /// Returns a [`RemoteError`] if the server rejects the request.
    fn trigger_build(
        &self,
        build_type_id: &str,
        branch: &str,
        clean_rebuild: bool,
        queue_at_top: bool,
    ) -> Result<BuildSnapshot, RemoteError>;
}

/// Every test page of a build, following `next_page` until it runs out.
///
/// # Errors
///
/// Returns the first page error.
pub fn fetch_all_test_pages(
    remote: &dyn RemoteCiClient,
    build_id: u32,
    with_details: bool,
) -> Result<Vec<TestPage>, RemoteError> {
    let mut pages = Vec::new();
    let mut next: Option<String> = None;
    loop {
        let page = remote.get_tests_page(build_id, next.as_deref(), with_details)?;
        next.clone_from(&page.next_page);
        pages.push(page);
        if next.is_none() {
            return Ok(pages);
        }
    }
}
