//! Parsing of the command line a Git client sends in its `exec` request.

use crate::protocol::{ProtocolError, Service};

/// A parsed exec request such as `git-upload-pack '/team/project.git'`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecCommand {
    pub service: Service,
    /// Repository path as sent by the client, before name normalisation.
    pub repo: String,
}

/// Parse the raw exec command line.
///
/// The first whitespace-separated token names the service; the second is the path.
/// Quotes around the path, a `host:` prefix (scp-style remotes) and leading slashes are
/// removed. Tokens after the path are ignored.
pub fn parse_exec_command(raw: &str) -> Result<ExecCommand, ProtocolError> {
    let mut tokens = raw.split_whitespace();
    let service: Service = tokens
        .next()
        .ok_or_else(|| ProtocolError::invalid_request("empty exec command"))?
        .parse()?;
    let path = tokens
        .next()
        .ok_or_else(|| ProtocolError::invalid_request(format!("{service} needs a repository path")))?;

    let path = path.trim_matches(|c| c == '\'' || c == '"');
    let path = path.split_once(':').map_or(path, |(_, rest)| rest);
    let repo = path.trim_start_matches('/');
    if repo.is_empty() {
        return Err(ProtocolError::invalid_request(format!(
            "{service} needs a repository path"
        )));
    }

    Ok(ExecCommand {
        service,
        repo: repo.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quoted_paths() {
        let cmd = parse_exec_command("git-upload-pack '/team/project.git'").unwrap();
        assert_eq!(cmd.service, Service::UploadPack);
        assert_eq!(cmd.repo, "team/project.git");

        let cmd = parse_exec_command("git-receive-pack \"demo\"").unwrap();
        assert_eq!(cmd.service, Service::ReceivePack);
        assert_eq!(cmd.repo, "demo");
    }

    #[test]
    fn test_parse_host_prefix_and_bare_path() {
        let cmd = parse_exec_command("git-upload-pack 'git.example.com:/srv/demo.git'").unwrap();
        assert_eq!(cmd.repo, "srv/demo.git");

        let cmd = parse_exec_command("  git-receive-pack   demo.git  ").unwrap();
        assert_eq!(cmd.repo, "demo.git");
    }

    #[test]
    fn test_parse_rejects_unknown_or_incomplete() {
        assert!(matches!(
            parse_exec_command("git-upload-archive 'demo'"),
            Err(ProtocolError::InvalidService(_))
        ));
        assert!(matches!(
            parse_exec_command("ls -la"),
            Err(ProtocolError::InvalidService(_))
        ));
        assert!(matches!(
            parse_exec_command("git-upload-pack"),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(matches!(
            parse_exec_command("git-upload-pack '/'"),
            Err(ProtocolError::InvalidRequest(_))
        ));
        assert!(parse_exec_command("").is_err());
    }
}
