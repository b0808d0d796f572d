//! Classification of request targets.
//!
//! A raw target string is either a remote URL served over the network, a virtual location that
//! only the transport can resolve (archive-internal paths such as
//! `jar:file:///app.apk!/assets/clip.raw`, `content://` URIs), or a local file-system path.

use std::path::PathBuf;

use url::Url;

use crate::error::{RequestResult, SetupError};

const ARCHIVE_SEPARATOR: &str = "!/";

/// A classified request target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Network location (`http`, `https`, `ftp`).
    Remote(Url),
    /// Location readable only through the transport.
    Virtual(String),
    /// Local file-system path (plain path or `file://` URL).
    Local(PathBuf),
}

impl Target {
    pub fn parse(raw: &str) -> RequestResult<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(SetupError::EmptyTarget.into());
        }

        if raw.contains(ARCHIVE_SEPARATOR) {
            return Ok(Target::Virtual(raw.to_owned()));
        }

        let url = match Url::parse(raw) {
            Ok(url) => url,
            // Relative paths and anything without a scheme are local.
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                return Ok(Target::Local(PathBuf::from(raw)));
            }
            Err(e) => {
                return Err(SetupError::InvalidTarget {
                    target: raw.to_owned(),
                    reason: e.to_string(),
                }
                .into());
            }
        };

        match url.scheme() {
            "http" | "https" | "ftp" => Ok(Target::Remote(url)),
            "file" => url
                .to_file_path()
                .map(Target::Local)
                .map_err(|()| {
                    SetupError::InvalidTarget {
                        target: raw.to_owned(),
                        reason: "not a valid file URL".to_owned(),
                    }
                    .into()
                }),
            // Windows drive letters parse as one-letter schemes.
            scheme if scheme.len() == 1 => Ok(Target::Local(PathBuf::from(raw))),
            _ => Ok(Target::Virtual(raw.to_owned())),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, Target::Local(_))
    }
}
