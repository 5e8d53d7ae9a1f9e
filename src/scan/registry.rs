/// Parsing and classification of registry-style rules is portable; only the
/// live adapter below is Windows-specific.

const HIVES: &[(&str, &str)] = &[
    ("HKEY_CURRENT_USER", "HKEY_CURRENT_USER"),
    ("HKCU", "HKEY_CURRENT_USER"),
    ("HKEY_LOCAL_MACHINE", "HKEY_LOCAL_MACHINE"),
    ("HKLM", "HKEY_LOCAL_MACHINE"),
    ("HKEY_USERS", "HKEY_USERS"),
    ("HKU", "HKEY_USERS"),
    ("HKEY_CLASSES_ROOT", "HKEY_CLASSES_ROOT"),
    ("HKCR", "HKEY_CLASSES_ROOT"),
];

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct RegistryItem {
    raw: String,
}

impl RegistryItem {
    pub fn new(raw: String) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> String {
        self.raw.to_string()
    }

    pub fn is_registry_path(candidate: &str) -> bool {
        Self::new(candidate.to_string()).hive_and_key().is_some()
    }

    /// Splits into a normalized full hive name and the subkey path.
    pub fn hive_and_key(&self) -> Option<(String, String)> {
        let cleaned = self.raw.trim().replace('/', "\\");
        let (prefix, key) = cleaned.split_once('\\')?;
        let hive = HIVES
            .iter()
            .find(|(alias, _)| prefix.eq_ignore_ascii_case(alias))
            .map(|(_, full)| full.to_string())?;
        let key = key.trim_matches('\\');
        if key.is_empty() {
            return None;
        }
        Some((hive, key.to_string()))
    }
}

/// Capability for reading string values under a registry key. The detector
/// treats values that resemble paths as additional location templates.
pub trait RegistryAdapter {
    fn read_string_values(&self, item: &RegistryItem) -> Vec<String>;
}

/// Installed on hosts without a registry.
pub struct NoopRegistryAdapter;

impl RegistryAdapter for NoopRegistryAdapter {
    fn read_string_values(&self, _item: &RegistryItem) -> Vec<String> {
        vec![]
    }
}

#[cfg(target_os = "windows")]
pub use win::WinRegistryAdapter;

#[cfg(target_os = "windows")]
mod win {
    use super::{RegistryAdapter, RegistryItem};
    use crate::scan::{with_timeout, ADAPTER_TIMEOUT};

    pub struct WinRegistryAdapter;

    fn hkey_from_name(name: &str) -> Option<winreg::HKEY> {
        match name {
            "HKEY_CURRENT_USER" => Some(winreg::enums::HKEY_CURRENT_USER),
            "HKEY_LOCAL_MACHINE" => Some(winreg::enums::HKEY_LOCAL_MACHINE),
            "HKEY_USERS" => Some(winreg::enums::HKEY_USERS),
            "HKEY_CLASSES_ROOT" => Some(winreg::enums::HKEY_CLASSES_ROOT),
            _ => None,
        }
    }

    fn read_view(hive: winreg::HKEY, key: &str, flags: u32) -> Vec<String> {
        let mut values = vec![];
        let subkey = match winreg::RegKey::predef(hive).open_subkey_with_flags(key, winreg::enums::KEY_READ | flags) {
            Ok(x) => x,
            Err(e) => {
                log::debug!("unable to open registry key {key:?}: {e}");
                return values;
            }
        };
        for (name, value) in subkey.enum_values().filter_map(|x| x.ok()) {
            match value.vtype {
                winreg::enums::RegType::REG_SZ | winreg::enums::RegType::REG_EXPAND_SZ => {
                    let text = value.to_string();
                    if !text.trim().is_empty() {
                        log::trace!("registry value {name:?} = {text:?}");
                        values.push(text);
                    }
                }
                _ => {}
            }
        }
        values
    }

    impl RegistryAdapter for WinRegistryAdapter {
        fn read_string_values(&self, item: &RegistryItem) -> Vec<String> {
            let Some((hive_name, key)) = item.hive_and_key() else {
                return vec![];
            };

            // HKLM is queried in both the 32- and 64-bit views. The raw HKEY
            // handle is not Send, so it is resolved inside the worker.
            with_timeout(ADAPTER_TIMEOUT, move || {
                let Some(hive) = hkey_from_name(&hive_name) else {
                    return vec![];
                };
                let views: &[u32] = if hive_name == "HKEY_LOCAL_MACHINE" {
                    &[winreg::enums::KEY_WOW64_64KEY, winreg::enums::KEY_WOW64_32KEY]
                } else {
                    &[0]
                };

                let mut values = vec![];
                for view in views {
                    for value in read_view(hive, &key, *view) {
                        if !values.contains(&value) {
                            values.push(value);
                        }
                    }
                }
                values
            })
            .unwrap_or_default()
        }
    }
}
