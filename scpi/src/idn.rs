use instrument_types::Error;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The reply to `*IDN?`: `<manufacturer>,<model>,<serial>,<firmware>`.
///
/// Fields missing from the reply are simply empty, no attempt is made to check how many
/// fields an instrument actually sent.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Idn {
    manufacturer: String,
    model: String,
    serial_number: String,
    firmware_revision: String,
}

impl Idn {
    pub fn parse(response: &str) -> Self {
        let mut fields = response
            .trim_end_matches(['\r', '\n', '\0'])
            .split(',')
            .map(|field| field.trim().to_string());

        Self {
            manufacturer: fields.next().unwrap_or_default(),
            model: fields.next().unwrap_or_default(),
            serial_number: fields.next().unwrap_or_default(),
            firmware_revision: fields.next().unwrap_or_default(),
        }
    }

    pub fn from_bytes(response: &[u8]) -> Self {
        Self::parse(&String::from_utf8_lossy(response))
    }

    pub fn manufacturer(&self) -> &str {
        &self.manufacturer
    }
    pub fn model(&self) -> &str {
        &self.model
    }
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }
    pub fn firmware_revision(&self) -> &str {
        &self.firmware_revision
    }
}

impl FromStr for Idn {
    type Err = Error;

    fn from_str(response: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(response))
    }
}

impl Display for Idn {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{},{},{},{}",
            self.manufacturer, self.model, self.serial_number, self.firmware_revision
        )
    }
}
