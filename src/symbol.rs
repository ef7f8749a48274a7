use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

// Lowercase words joined by single hyphens. Underscores, colons and dots are
// reserved as separators in file names and canonical id strings, so the
// grammar must never produce them.
static SYMBOL_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z][a-z0-9]*(?:-[a-z][a-z0-9]*)*$").unwrap());

#[derive(Debug, Error)]
pub enum SymbolError {
    #[error("invalid {kind} symbol: {value:?}")]
    Invalid { kind: &'static str, value: String },
    #[error("unknown subject: {0:?}")]
    UnknownSubject(String),
    #[error("invalid instrument symbol: {0:?}")]
    InvalidInstrument(String),
    #[error("invalid market symbol: {0:?}")]
    InvalidMarket(String),
}

macro_rules! symbol_type {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Result<Self, SymbolError> {
                let value = value.into();
                if SYMBOL_REGEX.is_match(&value) {
                    Ok(Self(value))
                } else {
                    Err(SymbolError::Invalid {
                        kind: $kind,
                        value,
                    })
                }
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = SymbolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }
    };
}

symbol_type!(
    /// A bare symbolic atom, also used for instrument extensions.
    Symbol,
    "generic"
);
symbol_type!(
    /// A data provider, e.g. `kraken-rest`.
    SourceSymbol,
    "source"
);
symbol_type!(
    /// A trading venue, e.g. `kraken`.
    ExchangeSymbol,
    "exchange"
);
symbol_type!(
    /// One leg of an instrument, e.g. `btc`.
    AssetSymbol,
    "asset"
);

/// Closed enumeration of record categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Subject {
    Trades,
    Ohlc1m,
    Ohlc1h,
    Ohlc1d,
    BookFull,
    BookSpread,
    BookDiff,
}

impl Subject {
    pub const ALL: [Subject; 7] = [
        Subject::Trades,
        Subject::Ohlc1m,
        Subject::Ohlc1h,
        Subject::Ohlc1d,
        Subject::BookFull,
        Subject::BookSpread,
        Subject::BookDiff,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Subject::Trades => "trades",
            Subject::Ohlc1m => "ohlc-1m",
            Subject::Ohlc1h => "ohlc-1h",
            Subject::Ohlc1d => "ohlc-1d",
            Subject::BookFull => "book-full",
            Subject::BookSpread => "book-spread",
            Subject::BookDiff => "book-diff",
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subject::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| SymbolError::UnknownSubject(s.to_string()))
    }
}

/// A tradable pair, `base/quote` with an optional extension part
/// (e.g. `btc/usd/q21` for a dated future).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstrumentSymbol {
    base: AssetSymbol,
    quote: AssetSymbol,
    extension: Option<Symbol>,
}

impl InstrumentSymbol {
    pub fn new(base: AssetSymbol, quote: AssetSymbol, extension: Option<Symbol>) -> Self {
        Self {
            base,
            quote,
            extension,
        }
    }

    pub fn base(&self) -> &AssetSymbol {
        &self.base
    }

    pub fn quote(&self) -> &AssetSymbol {
        &self.quote
    }

    pub fn extension(&self) -> Option<&Symbol> {
        self.extension.as_ref()
    }

    /// Component strings in canonical order.
    pub fn parts(&self) -> impl Iterator<Item = &str> {
        [self.base.as_str(), self.quote.as_str()]
            .into_iter()
            .chain(self.extension.as_ref().map(Symbol::as_str))
    }
}

impl fmt::Display for InstrumentSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.base, self.quote)?;
        if let Some(extension) = &self.extension {
            write!(f, "/{extension}")?;
        }
        Ok(())
    }
}

impl FromStr for InstrumentSymbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [base, quote] => Ok(Self::new(base.parse()?, quote.parse()?, None)),
            [base, quote, extension] => Ok(Self::new(
                base.parse()?,
                quote.parse()?,
                Some(extension.parse()?),
            )),
            _ => Err(SymbolError::InvalidInstrument(s.to_string())),
        }
    }
}

/// An instrument traded on a specific venue, `exchange:instrument`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MarketSymbol {
    exchange: ExchangeSymbol,
    instrument: InstrumentSymbol,
}

impl MarketSymbol {
    pub fn new(exchange: ExchangeSymbol, instrument: InstrumentSymbol) -> Self {
        Self {
            exchange,
            instrument,
        }
    }

    pub fn exchange(&self) -> &ExchangeSymbol {
        &self.exchange
    }

    pub fn instrument(&self) -> &InstrumentSymbol {
        &self.instrument
    }
}

impl fmt::Display for MarketSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.exchange, self.instrument)
    }
}

impl FromStr for MarketSymbol {
    type Err = SymbolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (exchange, instrument) = s
            .split_once(':')
            .ok_or_else(|| SymbolError::InvalidMarket(s.to_string()))?;
        Ok(Self::new(exchange.parse()?, instrument.parse()?))
    }
}
