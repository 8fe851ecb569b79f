//! Module versions and version ranges
//!
//! Versions are `MAJOR[.MINOR[.PATCH]]`; a `-pre` or `+build` suffix is
//! accepted and ignored for ordering. Ranges use interval notation:
//!
//! | Range         | Meaning              |
//! |---------------|----------------------|
//! | `*` or empty  | any version          |
//! | `1.2`         | `>= 1.2.0`           |
//! | `[1.0,2.0)`   | `>= 1.0.0, < 2.0.0`  |
//! | `(1.0,2.0]`   | `> 1.0.0, <= 2.0.0`  |

use std::fmt;
use std::str::FromStr;

use crate::error::{CdmfError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let base = s.split(['-', '+']).next().unwrap_or("");
        if base.is_empty() {
            return Err(CdmfError::invalid(format!("invalid version {:?}", s)));
        }
        let mut parts = [0u64; 3];
        let mut count = 0;
        for piece in base.split('.') {
            if count == 3 {
                return Err(CdmfError::invalid(format!("too many components in {:?}", s)));
            }
            parts[count] = piece
                .parse()
                .map_err(|_| CdmfError::invalid(format!("invalid version {:?}", s)))?;
            count += 1;
        }
        Ok(Version::new(parts[0], parts[1], parts[2]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

/// Interval of acceptable versions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionRange {
    min: Option<Bound>,
    max: Option<Bound>,
}

impl VersionRange {
    /// Matches every version
    pub fn any() -> Self {
        Self::default()
    }

    /// `>= version`
    pub fn at_least(version: Version) -> Self {
        Self {
            min: Some(Bound {
                version,
                inclusive: true,
            }),
            max: None,
        }
    }

    pub fn is_any(&self) -> bool {
        self.min.is_none() && self.max.is_none()
    }

    pub fn includes(&self, version: &Version) -> bool {
        let above = match self.min {
            Some(b) if b.inclusive => *version >= b.version,
            Some(b) => *version > b.version,
            None => true,
        };
        let below = match self.max {
            Some(b) if b.inclusive => *version <= b.version,
            Some(b) => *version < b.version,
            None => true,
        };
        above && below
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.min, self.max) {
            (None, None) => f.write_str("*"),
            (Some(min), None) if min.inclusive => write!(f, "{}", min.version),
            (min, max) => {
                let (open, low) = match min {
                    Some(b) => (if b.inclusive { '[' } else { '(' }, b.version.to_string()),
                    None => ('[', Version::default().to_string()),
                };
                f.write_str(&format!("{}{},", open, low))?;
                match max {
                    Some(b) => write!(f, "{}{}", b.version, if b.inclusive { ']' } else { ')' }),
                    None => f.write_str(")"),
                }
            }
        }
    }
}

impl FromStr for VersionRange {
    type Err = CdmfError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() || s == "*" {
            return Ok(VersionRange::any());
        }

        let first = s.chars().next().unwrap_or(' ');
        if first != '[' && first != '(' {
            return Ok(VersionRange::at_least(s.parse()?));
        }

        let last = s.chars().last().unwrap_or(' ');
        if last != ']' && last != ')' {
            return Err(CdmfError::invalid(format!("unterminated version range {:?}", s)));
        }
        let body = &s[1..s.len() - 1];
        let (low, high) = body
            .split_once(',')
            .ok_or_else(|| CdmfError::invalid(format!("version range needs two bounds: {:?}", s)))?;

        let min = Some(Bound {
            version: low.parse()?,
            inclusive: first == '[',
        });
        let max = if high.trim().is_empty() {
            None
        } else {
            Some(Bound {
                version: high.parse()?,
                inclusive: last == ']',
            })
        };
        if let (Some(lo), Some(hi)) = (min, max) {
            if lo.version > hi.version {
                return Err(CdmfError::invalid(format!("empty version range {:?}", s)));
            }
        }
        Ok(VersionRange { min, max })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_versions() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v("1.2.3-beta+7"), Version::new(1, 2, 3));
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("x.1".parse::<Version>().is_err());
        assert!("".parse::<Version>().is_err());
        assert!(v("1.10.0") > v("1.9.9"));
    }

    #[test]
    fn test_ranges() {
        let r: VersionRange = "[1.0,2.0)".parse().unwrap();
        assert!(r.includes(&v("1.0.0")));
        assert!(r.includes(&v("1.9.9")));
        assert!(!r.includes(&v("2.0.0")));

        let r: VersionRange = "(1.0,2.0]".parse().unwrap();
        assert!(!r.includes(&v("1.0.0")));
        assert!(r.includes(&v("2.0.0")));

        let r: VersionRange = "1.5".parse().unwrap();
        assert!(r.includes(&v("7.0")));
        assert!(!r.includes(&v("1.4.9")));

        assert!("*".parse::<VersionRange>().unwrap().is_any());
        assert!("[1.0,".parse::<VersionRange>().is_err());
        assert!("[2.0,1.0]".parse::<VersionRange>().is_err());
    }

    #[test]
    fn test_display_reparses() {
        for s in ["*", "1.2.0", "[1.0.0,2.0.0)", "(1.0.0,2.0.0]"] {
            let r: VersionRange = s.parse().unwrap();
            assert_eq!(r.to_string(), s);
            assert_eq!(r.to_string().parse::<VersionRange>().unwrap(), r);
        }
    }
}
