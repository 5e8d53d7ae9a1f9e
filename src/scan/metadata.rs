use crate::prelude::StrictPath;

/// Version metadata read from an executable.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExeMetadata {
    pub product_name: Option<String>,
    pub file_description: Option<String>,
}

impl ExeMetadata {
    pub fn is_empty(&self) -> bool {
        self.product_name.is_none() && self.file_description.is_none()
    }
}

/// Capability for reading executable version metadata. Timeouts and
/// unreadable executables are treated as absence of data, never as failure.
pub trait ExeMetadataAdapter {
    fn read(&self, exe: &StrictPath) -> Option<ExeMetadata>;
}

/// Installed on hosts where executable version resources do not exist.
pub struct NoopExeMetadataAdapter;

impl ExeMetadataAdapter for NoopExeMetadataAdapter {
    fn read(&self, _exe: &StrictPath) -> Option<ExeMetadata> {
        None
    }
}

#[cfg(target_os = "windows")]
pub use win::PowershellExeMetadataAdapter;

#[cfg(target_os = "windows")]
mod win {
    use std::io::Read;

    use super::{ExeMetadata, ExeMetadataAdapter};
    use crate::{
        prelude::StrictPath,
        scan::{ADAPTER_OUTPUT_LIMIT, ADAPTER_TIMEOUT},
    };

    pub struct PowershellExeMetadataAdapter;

    fn clean(value: Option<&serde_json::Value>) -> Option<String> {
        let text = value?.as_str()?.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    }

    impl ExeMetadataAdapter for PowershellExeMetadataAdapter {
        fn read(&self, exe: &StrictPath) -> Option<ExeMetadata> {
            if !exe.is_file() {
                log::debug!("executable does not exist: {:?}", exe.raw());
                return None;
            }

            let escaped = exe.interpret().replace('\'', "''");
            let script = format!(
                "$v = (Get-Item -LiteralPath '{escaped}').VersionInfo; \
                 [PSCustomObject]@{{ProductName=$v.ProductName; FileDescription=$v.FileDescription}} \
                 | ConvertTo-Json -Compress"
            );

            let mut child = std::process::Command::new("powershell")
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .spawn()
                .map_err(|e| log::warn!("unable to spawn powershell: {e}"))
                .ok()?;

            // Bounded read on a worker thread, so a wedged process can't
            // block detection or flood memory.
            let mut stdout = child.stdout.take()?;
            let reader = std::thread::spawn(move || {
                let mut output = vec![];
                let mut buffer = [0u8; 8 * 1024];
                while output.len() < ADAPTER_OUTPUT_LIMIT {
                    match stdout.read(&mut buffer) {
                        Ok(0) | Err(_) => break,
                        Ok(read) => output.extend_from_slice(&buffer[..read]),
                    }
                }
                output
            });

            let deadline = std::time::Instant::now() + ADAPTER_TIMEOUT;
            loop {
                match child.try_wait() {
                    Ok(Some(_)) => break,
                    Ok(None) => {
                        if std::time::Instant::now() >= deadline {
                            log::warn!("metadata reader timed out: {:?}", exe.raw());
                            let _ = child.kill();
                            let _ = child.wait();
                            return None;
                        }
                        std::thread::sleep(std::time::Duration::from_millis(25));
                    }
                    Err(e) => {
                        log::warn!("unable to wait for metadata reader: {e}");
                        let _ = child.kill();
                        return None;
                    }
                }
            }

            let output = reader.join().ok()?;
            let parsed: serde_json::Value = serde_json::from_slice(&output).ok()?;
            let metadata = ExeMetadata {
                product_name: clean(parsed.get("ProductName")),
                file_description: clean(parsed.get("FileDescription")),
            };
            (!metadata.is_empty()).then_some(metadata)
        }
    }
}
