//! Archive format detection from a file name or URL.

use std::fmt;

/// Container formats understood by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchiveFormat {
    Zip,
    Tar,
    TarGz,
    Unsupported,
}

impl ArchiveFormat {
    /// Detect the format from a file name using a case-insensitive suffix match.
    ///
    /// Query strings and fragments are ignored so that URLs can be passed
    /// directly.
    pub fn detect(name: &str) -> Self {
        let name = name
            .split(['?', '#'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        // Compound suffixes first: `.tar.gz` must not be taken for `.gz`.
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            ArchiveFormat::TarGz
        } else if name.ends_with(".gz") {
            // A bare gzip stream has no entry list.
            ArchiveFormat::Unsupported
        } else if name.ends_with(".tar") {
            ArchiveFormat::Tar
        } else if name.ends_with(".zip") {
            ArchiveFormat::Zip
        } else {
            ArchiveFormat::Unsupported
        }
    }

    pub fn is_supported(&self) -> bool {
        *self != ArchiveFormat::Unsupported
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::Tar => "tar",
            ArchiveFormat::TarGz => "tar.gz",
            ArchiveFormat::Unsupported => "unsupported",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_by_suffix() {
        assert_eq!(ArchiveFormat::detect("a.zip"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::detect("A.ZIP"), ArchiveFormat::Zip);
        assert_eq!(ArchiveFormat::detect("a.tar"), ArchiveFormat::Tar);
        assert_eq!(ArchiveFormat::detect("a.tar.gz"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect("a.TGZ"), ArchiveFormat::TarGz);
        assert_eq!(ArchiveFormat::detect("a.gz"), ArchiveFormat::Unsupported);
        assert_eq!(ArchiveFormat::detect("a.rar"), ArchiveFormat::Unsupported);
        assert_eq!(ArchiveFormat::detect(""), ArchiveFormat::Unsupported);
    }

    #[test]
    fn ignores_query_and_fragment() {
        assert_eq!(
            ArchiveFormat::detect("https://host/data.tar.gz?sig=abc.zip"),
            ArchiveFormat::TarGz
        );
        assert_eq!(ArchiveFormat::detect("https://host/x.zip#frag"), ArchiveFormat::Zip);
    }
}
