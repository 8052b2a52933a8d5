use anyhow::{Context, Result};
use instrument_types::{Address, Timeouts};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{create_dir_all, File};
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub open_timeout_ms: u64,
    pub command_timeout_ms: u64,

    /// Short names for VISA resource strings, "scope" => "TCPIP0::192.168.1.20::INSTR".
    pub aliases: BTreeMap<String, String>,
}

impl Default for Settings {
    fn default() -> Self {
        let timeouts = Timeouts::default();
        Self {
            open_timeout_ms: timeouts.open.as_millis() as u64,
            command_timeout_ms: timeouts.command.as_millis() as u64,
            aliases: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn read(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => serde_json::from_reader(reader).context(format!(
                "Could not parse settings file at {}",
                path.to_string_lossy()
            )),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(error) => Err(error).context(format!(
                "Could not open settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if let Err(e) = create_dir_all(parent) {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(e).context(format!(
                        "Could not create settings directory at {}",
                        parent.to_string_lossy()
                    ));
                }
            }
        }
        let writer = File::create(path).context(format!(
            "Could not open settings file for writing at {}",
            path.to_string_lossy()
        ))?;
        serde_json::to_writer_pretty(writer, self).context(format!(
            "Could not write to settings file at {}",
            path.to_string_lossy()
        ))?;
        Ok(())
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::new(
            Duration::from_millis(self.open_timeout_ms),
            Duration::from_millis(self.command_timeout_ms),
        )
    }

    /// Turns an alias, or failing that a VISA resource string, into an address.
    pub fn resolve(&self, name: &str) -> Result<Address> {
        let resource = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        resource
            .parse()
            .context(format!("'{}' is neither an alias nor a resource string", name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use instrument_types::NetworkAddress;

    #[test]
    fn missing_files_give_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::read(&dir.path().join("settings.json")).unwrap();
        assert_eq!(settings, Settings::default());
        assert_eq!(settings.timeouts(), Timeouts::default());
    }

    #[test]
    fn settings_survive_a_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut settings = Settings::default();
        settings.command_timeout_ms = 10_000;
        settings
            .aliases
            .insert("dmm".into(), "TCPIP0::10.0.0.5::5025::SOCKET".into());
        settings.write(&path).unwrap();

        let read = Settings::read(&path).unwrap();
        assert_eq!(read, settings);
        assert_eq!(read.timeouts().command, Duration::from_secs(10));
    }

    #[test]
    fn partial_files_fill_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "open_timeout_ms": 500 }"#).unwrap();

        let settings = Settings::read(&path).unwrap();
        assert_eq!(settings.open_timeout_ms, 500);
        assert_eq!(settings.command_timeout_ms, 2000);
    }

    #[test]
    fn broken_files_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(Settings::read(&path).is_err());
    }

    #[test]
    fn aliases_resolve_before_resource_strings() {
        let mut settings = Settings::default();
        settings
            .aliases
            .insert("dmm".into(), "TCPIP0::10.0.0.5::5025::SOCKET".into());

        assert_eq!(
            settings.resolve("dmm").unwrap(),
            Address::RawSocket(NetworkAddress::new("10.0.0.5", Some(5025)))
        );
        assert!(matches!(
            settings.resolve("TCPIP0::10.0.0.6::INSTR").unwrap(),
            Address::Vxi11(_)
        ));
        assert!(settings.resolve("nonsense").is_err());
    }
}
