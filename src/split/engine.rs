//! Partition a batch's files into one directory per organisation.
use super::csv_join::join_files;
use super::csv_split::{read_header, sanitise_component, split_by_columns, write_header_only};
use super::SplitPolicy;
use crate::unpack::StagedFile;
use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    SplitByOrg,
    SplitByOrgAndOrder,
    CopyUnchanged,
    Ignore,
}

/// One organisation directory produced for a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgDirectory {
    pub dir_name: String,
    /// Raw column value when the organisation was seen in this batch's data;
    /// `None` when carried over from the previous batch only.
    pub org_value: Option<String>,
    pub path: PathBuf,
}

pub fn classify_file(policy: &SplitPolicy, file: &StagedFile) -> Result<FileAction> {
    if policy.ignore.iter().any(|t| t == &file.file_type) {
        return Ok(FileAction::Ignore);
    }
    if policy.never_split.iter().any(|t| t == &file.file_type) {
        return Ok(FileAction::CopyUnchanged);
    }
    let header = read_header(&file.path)?;
    let has = |col: &str| header.iter().any(|h| h.trim_start_matches('\u{feff}') == col);
    if !has(&policy.org_column) {
        return Ok(FileAction::CopyUnchanged);
    }
    match &policy.order_column {
        Some(order) if has(order) => Ok(FileAction::SplitByOrgAndOrder),
        _ => Ok(FileAction::SplitByOrg),
    }
}

/// Sort fragments numerically when every order value is an integer,
/// lexicographically otherwise.
fn sort_by_order_value(fragments: &mut [(String, PathBuf)]) {
    let numeric: Option<Vec<i64>> = fragments.iter().map(|(v, _)| v.trim().parse().ok()).collect();
    if numeric.is_some() {
        fragments.sort_by_key(|(v, _)| v.trim().parse::<i64>().unwrap_or(i64::MAX));
    } else {
        fragments.sort_by(|a, b| a.0.cmp(&b.0));
    }
}

/// Reserve the directory for raw organisation value `raw`, refusing a second
/// value that sanitises to the same name.
fn claim_org_dir(org_values: &mut BTreeMap<String, Option<String>>, raw: &str) -> Result<String> {
    let dir_name = sanitise_component(raw);
    if let Some(Some(existing)) = org_values.get(&dir_name) {
        if existing != raw {
            return Err(anyhow!(
                "organisations {:?} and {:?} both map to split directory {:?}",
                existing,
                raw,
                dir_name
            ));
        }
    }
    org_values.insert(dir_name.clone(), Some(raw.to_string()));
    Ok(dir_name)
}

fn fragment_root(out_dir: &Path) -> PathBuf {
    let name = out_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "split".to_string());
    out_dir.with_file_name(format!("{}.fragments", name))
}

/// Split `files` into `out_dir/<organisation>/`.
///
/// Every organisation directory ends up with the same file names: data files
/// without rows for an organisation are backfilled with their header only,
/// unsplittable files are copied into each, and organisations listed in
/// `previous_orgs` get a directory even when absent from this batch.
pub fn split_files(
    policy: &SplitPolicy,
    files: &[StagedFile],
    previous_orgs: &[String],
    out_dir: &Path,
) -> Result<Vec<OrgDirectory>> {
    if out_dir.exists() {
        fs::remove_dir_all(out_dir)
            .with_context(|| format!("failed to clear {}", out_dir.display()))?;
    }
    fs::create_dir_all(out_dir).with_context(|| format!("failed to create {}", out_dir.display()))?;
    let fragments_dir = fragment_root(out_dir);
    if fragments_dir.exists() {
        fs::remove_dir_all(&fragments_dir)?;
    }

    let mut headers: BTreeMap<String, StringRecord> = BTreeMap::new();
    let mut org_values: BTreeMap<String, Option<String>> = BTreeMap::new();
    let mut copy_unchanged: Vec<&StagedFile> = Vec::new();

    for file in files {
        let action = classify_file(policy, file)?;
        debug!(filename = %file.filename, ?action, "classified");
        match action {
            FileAction::Ignore => continue,
            FileAction::CopyUnchanged => {
                headers.insert(file.filename.clone(), read_header(&file.path)?);
                copy_unchanged.push(file);
            }
            FileAction::SplitByOrg => {
                let result = split_by_columns(&file.path, out_dir, &[policy.org_column.as_str()])?;
                headers.insert(file.filename.clone(), result.header);
                for key in result.outputs.keys() {
                    claim_org_dir(&mut org_values, &key[0])?;
                }
            }
            FileAction::SplitByOrgAndOrder => {
                let order_column = policy
                    .order_column
                    .as_deref()
                    .ok_or_else(|| anyhow!("no order column configured"))?;
                let staging = fragments_dir.join(&file.filename);
                let result = split_by_columns(
                    &file.path,
                    &staging,
                    &[policy.org_column.as_str(), order_column],
                )?;
                headers.insert(file.filename.clone(), result.header);

                let mut per_org: BTreeMap<String, Vec<(String, PathBuf)>> = BTreeMap::new();
                for (key, path) in result.outputs {
                    per_org
                        .entry(key[0].clone())
                        .or_default()
                        .push((key[1].clone(), path));
                }
                for (org, mut fragments) in per_org {
                    sort_by_order_value(&mut fragments);
                    let dir_name = claim_org_dir(&mut org_values, &org)?;
                    let dir = out_dir.join(&dir_name);
                    fs::create_dir_all(&dir)?;
                    let paths: Vec<PathBuf> = fragments.into_iter().map(|(_, p)| p).collect();
                    join_files(&dir.join(&file.filename), &paths)?;
                }
                fs::remove_dir_all(&staging)
                    .with_context(|| format!("failed to remove {}", staging.display()))?;
            }
        }
    }
    if fragments_dir.exists() {
        fs::remove_dir_all(&fragments_dir)?;
    }

    for org in previous_orgs {
        org_values.entry(org.clone()).or_insert(None);
    }

    let mut dirs = Vec::with_capacity(org_values.len());
    for (dir_name, org_value) in org_values {
        let path = out_dir.join(&dir_name);
        fs::create_dir_all(&path)?;
        for file in &copy_unchanged {
            fs::copy(&file.path, path.join(&file.filename))
                .with_context(|| format!("failed to copy {} into {}", file.filename, dir_name))?;
        }
        for (filename, header) in &headers {
            let target = path.join(filename);
            if !target.exists() {
                write_header_only(&target, header)?;
            }
        }
        dirs.push(OrgDirectory {
            dir_name,
            org_value,
            path,
        });
    }

    validate_split_dirs(&dirs)?;
    Ok(dirs)
}

/// No sub-directories and the same file count in every organisation.
pub fn validate_split_dirs(dirs: &[OrgDirectory]) -> Result<()> {
    let mut expected: Option<(usize, &str)> = None;
    for dir in dirs {
        let mut count = 0usize;
        for entry in fs::read_dir(&dir.path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                return Err(anyhow!(
                    "split directory {} contains sub-directory {}",
                    dir.dir_name,
                    entry.file_name().to_string_lossy()
                ));
            }
            count += 1;
        }
        match expected {
            None => expected = Some((count, dir.dir_name.as_str())),
            Some((n, first)) if n != count => {
                return Err(anyhow!(
                    "split directory {} has {} files but {} has {}",
                    dir.dir_name,
                    count,
                    first,
                    n
                ))
            }
            _ => {}
        }
    }
    Ok(())
}
