//! Command-line entry points.

use std::ffi::OsStr;

use crate::prelude::*;

pub mod check;
pub mod convert;
pub mod schema;

/// Expand command-line inputs into a sorted list of PDF files.
///
/// Files are taken as given. Directories contribute the `*.pdf` files they
/// contain, and, with `recursive`, those of their subdirectories.
#[instrument(level = "debug", skip_all)]
pub async fn collect_pdf_inputs(inputs: &[PathBuf], recursive: bool) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for input in inputs {
        let metadata = tokio::fs::metadata(input)
            .await
            .with_context(|| format!("cannot access {:?}", input.display()))?;
        if metadata.is_dir() {
            collect_from_dir(input, recursive, &mut found).await?;
        } else {
            found.push(input.clone());
        }
    }
    found.sort();
    found.dedup();
    debug!(count = found.len(), "Collected input files");
    Ok(found)
}

async fn collect_from_dir(dir: &Path, recursive: bool, found: &mut Vec<PathBuf>) -> Result<()> {
    let mut pending = vec![dir.to_owned()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("cannot read directory {:?}", dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("cannot read directory {:?}", dir.display()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .with_context(|| format!("cannot access {:?}", path.display()))?;
            if file_type.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if is_pdf_name(&path) {
                found.push(path);
            }
        }
    }
    Ok(())
}

fn is_pdf_name(path: &Path) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.eq_ignore_ascii_case("pdf"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directories_expand_to_sorted_pdfs() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let nested = dir.path().join("2024");
        std::fs::create_dir(&nested)?;
        for name in ["b.pdf", "a.PDF", "notes.txt"] {
            std::fs::write(dir.path().join(name), "")?;
        }
        std::fs::write(nested.join("c.pdf"), "")?;

        let flat = collect_pdf_inputs(&[dir.path().to_owned()], false).await?;
        assert_eq!(flat, vec![dir.path().join("a.PDF"), dir.path().join("b.pdf")]);

        let deep = collect_pdf_inputs(&[dir.path().to_owned()], true).await?;
        assert_eq!(
            deep,
            vec![nested.join("c.pdf"), dir.path().join("a.PDF"), dir.path().join("b.pdf")]
        );
        Ok(())
    }

    #[tokio::test]
    async fn explicit_files_are_kept_once() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("scan.pdf");
        std::fs::write(&file, "")?;
        let found = collect_pdf_inputs(&[file.clone(), file.clone()], false).await?;
        assert_eq!(found, vec![file]);
        Ok(())
    }

    #[tokio::test]
    async fn missing_inputs_are_errors() {
        assert!(
            collect_pdf_inputs(&[PathBuf::from("/no/such/input.pdf")], false)
                .await
                .is_err()
        );
    }
}
