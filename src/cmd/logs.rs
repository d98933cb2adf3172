use std::path::{Path, PathBuf};

use anyhow::Result;

/// List run logs under `.kiln/logs`, or print the tail of the most
/// recent log for one issue.
pub fn execute(kiln_dir: &Path, issue: Option<u64>, tail: usize) -> Result<()> {
    let logs_dir = kiln_dir.join("logs");
    if !logs_dir.exists() {
        println!("no run logs yet");
        return Ok(());
    }

    let mut logs = collect_logs(&logs_dir)?;
    if let Some(number) = issue {
        let needle = format!("/{number}/");
        logs.retain(|p| p.to_string_lossy().contains(&needle));
    }
    logs.sort();

    match issue {
        None => {
            for log in &logs {
                if let Ok(rel) = log.strip_prefix(&logs_dir) {
                    println!("{}", rel.display());
                }
            }
            if logs.is_empty() {
                println!("no run logs yet");
            }
        }
        Some(number) => {
            let Some(latest) = logs.last() else {
                println!("no run logs for issue {number}");
                return Ok(());
            };
            let content = std::fs::read_to_string(latest)?;
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(tail);
            println!("==> {}", latest.display());
            for line in &lines[start..] {
                println!("{line}");
            }
        }
    }
    Ok(())
}

fn collect_logs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == "log") {
                out.push(path);
            }
        }
    }
    Ok(out)
}
