use crate::{prelude::StrictPath, scan::template};

/// Steam installation roots and library folders, used to expand the
/// `<steam-folder>` and `<steamlibrary-folder>` placeholders.
#[derive(Clone, Debug, Default)]
pub struct SteamEnv {
    pub roots: Vec<StrictPath>,
    pub libraries: Vec<StrictPath>,
}

impl SteamEnv {
    pub fn scan() -> Self {
        let mut instance = Self::default();

        match steamlocate::SteamDir::locate() {
            Ok(steam) => {
                log::trace!("found Steam directory: {:?}", steam.path());
                instance.roots.push(StrictPath::from_std_path_buf(steam.path()));
                match steam.libraries() {
                    Ok(libraries) => {
                        for library in libraries.filter_map(|x| x.ok()) {
                            instance.libraries.push(StrictPath::from_std_path_buf(library.path()));
                        }
                    }
                    Err(e) => {
                        log::warn!("Unable to enumerate Steam libraries: {e:?}");
                    }
                }
            }
            Err(e) => {
                log::warn!("Unable to locate Steam directory: {e:?}");
            }
        }

        for default in ["%ProgramFiles(x86)%\\Steam", "%ProgramFiles%\\Steam"] {
            let expanded = template::expand_env(default);
            if expanded.contains('%') {
                continue;
            }
            let path = StrictPath::new(expanded);
            if !instance.roots.iter().any(|x| x.equivalent(&path)) {
                instance.roots.push(path);
            }
        }

        if instance.libraries.is_empty() {
            instance.libraries = instance.roots.clone();
        }

        instance
    }
}
