//! HTTP-side helpers for the smart protocol: endpoint recognition on request paths, service
//! query parsing and the content types each response carries.

use serde::Deserialize;

use super::types::{ProtocolError, Service};

/// Smart HTTP endpoint addressed by a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitEndpoint {
    /// `GET <repo>/info/refs?service=...`
    InfoRefs,
    /// `POST <repo>/git-upload-pack`
    UploadPack,
    /// `POST <repo>/git-receive-pack`
    ReceivePack,
}

impl GitEndpoint {
    const SUFFIXES: [(&'static str, GitEndpoint); 3] = [
        ("/info/refs", GitEndpoint::InfoRefs),
        ("/git-upload-pack", GitEndpoint::UploadPack),
        ("/git-receive-pack", GitEndpoint::ReceivePack),
    ];
}

/// Result content type for a POSTed service
pub fn get_content_type(service: Service) -> &'static str {
    match service {
        Service::UploadPack => "application/x-git-upload-pack-result",
        Service::ReceivePack => "application/x-git-receive-pack-result",
    }
}

/// Get content type for Git HTTP info/refs advertisement
pub fn get_advertisement_content_type(service: Service) -> &'static str {
    match service {
        Service::UploadPack => "application/x-git-upload-pack-advertisement",
        Service::ReceivePack => "application/x-git-receive-pack-advertisement",
    }
}

/// Check if request is a Git smart protocol request
pub fn is_git_request(path: &str) -> bool {
    extract_repo_path(path).is_some()
}

/// Splits a request path into the repository part and the endpoint it addresses.
///
/// The repository part keeps any nesting (`team/project.git`) and loses leading slashes;
/// an empty repository part is not a Git request.
pub fn extract_repo_path(path: &str) -> Option<(&str, GitEndpoint)> {
    GitEndpoint::SUFFIXES.iter().find_map(|(suffix, endpoint)| {
        let repo = path.strip_suffix(suffix)?.trim_start_matches('/');
        (!repo.is_empty()).then_some((repo, *endpoint))
    })
}

/// Parameters for git info-refs request
#[derive(Debug, Default, Deserialize)]
pub struct InfoRefsParams {
    pub service: Option<String>,
}

impl InfoRefsParams {
    /// The requested service; dumb-protocol requests without one are rejected.
    pub fn service(&self) -> Result<Service, ProtocolError> {
        match self.service.as_deref() {
            Some(service) => service.parse(),
            None => Err(ProtocolError::invalid_request(
                "missing service parameter (dumb HTTP is not supported)",
            )),
        }
    }
}
