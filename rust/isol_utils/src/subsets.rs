// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! CPU-subset configuration.
//!
//! Multiple applications can share the isolation-capable CPUs by naming a
//! subset. `CPU_SUBSET_ID` selects a row in the subsets file,
//! `CPU_SUBSET` overrides that row inline. The file holds entries in the
//! format `<subset name>:<cpulist>`, for example:
//!
//! ```text
//! 1:1-12
//! 2:13-23   # second application
//! ```

use crate::read_cpulist;
use anyhow::Context;
use anyhow::Result;
use log::debug;
use std::path::Path;

pub const CPU_SUBSETS_FILE: &str = "/etc/cpu_subsets";

/// The subset id selected by the environment, if any. Also used to derive
/// the control-socket name suffix.
pub fn subset_id() -> Option<String> {
    std::env::var("CPU_SUBSET_ID").ok().filter(|s| !s.is_empty())
}

/// Look up a subset row in a subsets file. `#` starts a comment. Returns
/// the cpulist string of the matching row.
pub fn lookup_subset(path: &Path, id: &str) -> Result<Option<String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    for line in text.lines() {
        let line = match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        };
        let Some((name, cpulist)) = line.split_once(':') else {
            continue;
        };
        if name.trim() == id {
            return Ok(Some(cpulist.trim().to_string()));
        }
    }
    Ok(None)
}

/// Restrict `cpus` to the subset configured in the environment. With no
/// subset configured the list is returned unchanged.
pub fn resolve_cpu_subset(mut cpus: Vec<usize>) -> Result<Vec<usize>> {
    let subset_list = match (subset_id(), std::env::var("CPU_SUBSET").ok()) {
        (Some(_), Some(inline)) => Some(inline),
        (Some(id), None) => {
            let path = Path::new(CPU_SUBSETS_FILE);
            if path.exists() {
                lookup_subset(path, &id)?
            } else {
                None
            }
        }
        _ => None,
    };

    if let Some(list) = subset_list {
        let subset = read_cpulist(&list)?;
        cpus.retain(|cpu| subset.binary_search(cpu).is_ok());
        debug!("CPU subset restricts isolation CPUs to {:?}", cpus);
    }
    Ok(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_lookup_subset() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# subsets").unwrap();
        writeln!(file, "1:1-12").unwrap();
        writeln!(file, "2:13-23  # second app").unwrap();
        file.flush().unwrap();

        assert_eq!(
            lookup_subset(file.path(), "2").unwrap(),
            Some("13-23".to_string())
        );
        assert_eq!(
            lookup_subset(file.path(), "1").unwrap(),
            Some("1-12".to_string())
        );
        assert_eq!(lookup_subset(file.path(), "3").unwrap(), None);
    }
}
