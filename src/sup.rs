use crate::{err::Result, Map};
use anyhow::{anyhow, bail};
use std::path::Path;

/// $key = value; used to resolve file paths
pub type Manifest = Map<String, String>;

/// component name -> directory
pub type Components = Map<String, String>;

pub fn resolve_manifest(val: &mut String, manifest: &Manifest, base: &Path) -> Result<()> {
    // Recursively replace $key with values from manifest
    'a: loop {
        // Strip out {} to reduce ${key} to $key
        *val = val.replace(['{', '}'], "");
        for (k, v) in manifest {
            if val.contains(k.as_str()) {
                *val = val.replace(k.as_str(), v);
                continue 'a;
            }
        }
        if val.contains('$') {
            bail!("Unresolved marker: {val}; manifest={manifest:?}");
        }
        break;
    }
    let base = base
        .to_str()
        .ok_or_else(|| anyhow!("Circuit directory {base:?} is not valid UTF-8"))?;
    // Replace './' with the top-level of the config file
    if let Some(rest) = val.strip_prefix("./") {
        *val = format!("{base}/{rest}");
    }
    if !val.starts_with('/') {
        *val = format!("{base}/{val}");
    }
    Ok(())
}

/// Make `name` usable as a NEURON template or variable name: every non-word
/// character becomes `_`, as does a leading digit's prefix.
pub fn to_valid_nrn_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

/// Split `type:name` references, eg `hoc:Scnn1a_473845048`. References without
/// a type prefix yield `None` for the type.
pub fn split_reference(reference: &str) -> (Option<&str>, &str) {
    match reference.split_once(':') {
        Some((kind, name)) => (Some(kind), name),
        None => (None, reference),
    }
}
