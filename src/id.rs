use std::{cmp::Ordering, fmt, str::FromStr};

use thiserror::Error;

use crate::{
    symbol::{MarketSymbol, SourceSymbol, Subject, SymbolError},
    timekey::{TimeError, TimeKey},
};

/// Errors from parsing a canonical file id string.
#[derive(Debug, Error)]
pub enum ParseFileIdError {
    /// The string does not split into five colon-separated components.
    #[error("malformed file id {0:?}")]
    Malformed(String),
    /// A symbol component violates its grammar.
    #[error(transparent)]
    Symbol(#[from] SymbolError),
    /// The time component matches no canonical form.
    #[error(transparent)]
    Time(#[from] TimeError),
}

/// Identity of one stored file: what kind of data, who collected it, which
/// market it covers and the period it claims.
///
/// The canonical string form joins subject, source, exchange, instrument and
/// time key with colons:
///
/// ```text
/// trades:kraken-rest:kraken:btc/eur:2021-03-04
/// ```
///
/// Equality, ordering and the on-disk path scheme all derive from this form;
/// two ids render the same string exactly when they are the same id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileId {
    /// What the file stores.
    pub subject: Subject,
    /// Collector that produced the data.
    pub source: SourceSymbol,
    /// Market the rows belong to.
    pub market: MarketSymbol,
    /// Period the file claims.
    pub time: TimeKey,
}

impl FileId {
    /// Same file identity with a different time key; renames and merge
    /// targets during compaction keep every other component.
    pub fn with_time(&self, time: TimeKey) -> Self {
        FileId {
            time,
            ..self.clone()
        }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.subject, self.source, self.market, self.time
        )
    }
}

impl FromStr for FileId {
    type Err = ParseFileIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // The time component is the last field and may itself contain colons,
        // so split exactly five fields from the left.
        let mut fields = s.splitn(5, ':');
        let mut next = || {
            fields
                .next()
                .ok_or_else(|| ParseFileIdError::Malformed(s.to_owned()))
        };
        let subject = next()?;
        let source = next()?;
        let exchange = next()?;
        let instrument = next()?;
        let time = next()?;
        Ok(FileId {
            subject: subject.parse()?,
            source: source.parse()?,
            market: format!("{exchange}:{instrument}").parse()?,
            time: time.parse()?,
        })
    }
}

impl Ord for FileId {
    /// Lexicographic on the canonical string. This differs from field-wise
    /// comparison when one symbol extends another with a hyphen: `-` sorts
    /// before the `:` separator, so `kraken-rest` precedes `kraken` here.
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl PartialOrd for FileId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
