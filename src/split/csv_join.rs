//! Concatenate CSV fragments that share a header.
use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

/// Write the rows of `sources`, in order, to `dst` with the header once.
/// Every source must carry the same header as the first.
pub fn join_files(dst: &Path, sources: &[PathBuf]) -> Result<usize> {
    let Some(first) = sources.first() else {
        return Err(anyhow!("nothing to join into {}", dst.display()));
    };
    let expected = super::csv_split::read_header(first)?;

    let mut writer = csv::Writer::from_path(dst)
        .with_context(|| format!("failed to create {}", dst.display()))?;
    writer.write_record(&expected)?;

    let mut rows = 0usize;
    for src in sources {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .from_path(src)
            .with_context(|| format!("failed to open {}", src.display()))?;
        if reader.headers()? != &expected {
            return Err(anyhow!(
                "header of {} differs from {} while joining {}",
                src.display(),
                first.display(),
                dst.display()
            ));
        }
        for record in reader.records() {
            writer.write_record(&record?)?;
            rows += 1;
        }
    }
    writer.flush()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn joins_in_given_order() {
        let td = tempdir().unwrap();
        let a = td.path().join("a.csv");
        let b = td.path().join("b.csv");
        fs::write(&a, "H1,H2\n1,x\n").unwrap();
        fs::write(&b, "H1,H2\n2,y\n3,z\n").unwrap();
        let dst = td.path().join("out.csv");
        assert_eq!(join_files(&dst, &[b.clone(), a.clone()]).unwrap(), 3);
        assert_eq!(fs::read_to_string(&dst).unwrap(), "H1,H2\n2,y\n3,z\n1,x\n");
    }

    #[test]
    fn header_mismatch_is_an_error() {
        let td = tempdir().unwrap();
        let a = td.path().join("a.csv");
        let b = td.path().join("b.csv");
        fs::write(&a, "H1,H2\n1,x\n").unwrap();
        fs::write(&b, "H1,H3\n2,y\n").unwrap();
        let err = join_files(&td.path().join("out.csv"), &[a, b]).unwrap_err();
        assert!(err.to_string().contains("header"));
        assert!(join_files(&td.path().join("none.csv"), &[]).is_err());
    }
}
