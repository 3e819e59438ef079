//! Battery serial format.

use regex::Regex;

use crate::error::ValidationError;

/// Compiled serial pattern; scanned text is searched, so a serial embedded in
/// a URL or label text is still found.
#[derive(Debug, Clone)]
pub struct SerialFormat {
    re: Regex,
}

impl SerialFormat {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            re: Regex::new(pattern)?,
        })
    }

    /// First serial found in `input`.
    pub fn extract(&self, input: &str) -> Result<String, ValidationError> {
        self.re
            .find(input.trim())
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| ValidationError::MalformedSerial {
                input: input.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> SerialFormat {
        SerialFormat::new("RW-48v271[A-Za-z0-9]{4}").unwrap()
    }

    #[test]
    fn test_plain_serial() {
        assert_eq!(format().extract("RW-48v2710042").unwrap(), "RW-48v2710042");
    }

    #[test]
    fn test_serial_inside_url() {
        let got = format()
            .extract("https://tracking.example/battery?id=RW-48v271AB12&x=1")
            .unwrap();
        assert_eq!(got, "RW-48v271AB12");
    }

    #[test]
    fn test_rejects_malformed() {
        assert_eq!(
            format().extract("RW-48v27"),
            Err(ValidationError::MalformedSerial {
                input: "RW-48v27".into()
            })
        );
    }
}
