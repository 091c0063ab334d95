use anyhow::{Result, anyhow};
use std::path::PathBuf;
use url::Url;

/// Represents a parsed blob store location
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreUri {
    Local(PathBuf),
    S3 { bucket: String, prefix: String },
    Memory,
}

impl StoreUri {
    /// Parse a URI string into a StoreUri
    ///
    /// Accepts `s3://bucket[/prefix]`, `file:///path`, `memory://` or a bare
    /// local path.
    pub fn parse(uri: &str) -> Result<Self> {
        let uri = uri.trim();
        if uri.is_empty() {
            return Err(anyhow!("Store URI is empty"));
        }

        // Try parsing as URL first
        if let Ok(url) = Url::parse(uri) {
            match url.scheme() {
                "s3" => {
                    let bucket = url
                        .host_str()
                        .filter(|b| !b.is_empty())
                        .ok_or_else(|| anyhow!("S3 URI missing bucket: {}", uri))?
                        .to_string();

                    let prefix = url.path().trim_matches('/').to_string();

                    Ok(StoreUri::S3 { bucket, prefix })
                }
                "file" => {
                    let path = url
                        .to_file_path()
                        .map_err(|_| anyhow!("Invalid file:// URI: {}", uri))?;
                    Ok(StoreUri::Local(path))
                }
                "memory" => Ok(StoreUri::Memory),
                // single letter schemes are Windows drive letters
                scheme if scheme.len() == 1 => Ok(StoreUri::Local(PathBuf::from(uri))),
                scheme => Err(anyhow!("Unsupported store URI scheme: {}", scheme)),
            }
        } else {
            // Treat as local directory
            Ok(StoreUri::Local(PathBuf::from(uri)))
        }
    }
}
