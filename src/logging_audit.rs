// Static analysis tests that scan all Rust source files for tracing::
// calls containing client-document field patterns. Fiscal data belongs
// in the database and the audit payloads, never in logs; log lines get
// opaque ids only.

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    /// Field names and interpolations that would leak client data into
    /// log output.
    const SENSITIVE_PATTERNS: &[&str] = &[
        "supplier_name",
        "supplier_oib",
        "supplier_iban",
        "invoice_number",
        "narrative",
        "net_amount",
        "gross_amount",
        "full_text",
        "ocr_text",
        "prompt =",
        "password",
        "token =",
        "entry.amount",
        "booking.narrative",
        "fv.value",
    ];

    /// Files allowed to reference the patterns outside tracing contexts.
    const ALLOWLIST: &[&str] = &["logging_audit.rs"];

    #[test]
    fn no_client_data_in_tracing_calls() {
        let src_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("src");
        assert!(src_dir.exists(), "Source directory not found: {}", src_dir.display());

        let mut violations = Vec::new();
        scan_directory(&src_dir, &mut violations);

        if !violations.is_empty() {
            let report = violations
                .iter()
                .map(|(file, line_num, line, pattern)| {
                    format!("  {file}:{line_num}: found '{pattern}' in: {}", line.trim())
                })
                .collect::<Vec<_>>()
                .join("\n");
            panic!(
                "LOGGING AUDIT FAILED — {} violation(s) in tracing calls:\n{report}\n\n\
                 Fix: log opaque ids, not document contents.",
                violations.len(),
            );
        }
    }

    #[test]
    fn pattern_list_is_meaningful() {
        assert!(SENSITIVE_PATTERNS.len() >= 10);
    }

    #[test]
    fn scanner_detects_synthetic_violation() {
        let line = r#"tracing::info!(name = %supplier_name, "stored");"#;
        assert!(SENSITIVE_PATTERNS.iter().any(|p| line.contains(p)));
    }

    #[test]
    fn scanner_passes_clean_line() {
        let line = r#"tracing::info!(booking_id = %id, "booking stored");"#;
        assert!(!SENSITIVE_PATTERNS.iter().any(|p| line.contains(p)));
    }

    fn scan_directory(dir: &Path, violations: &mut Vec<(String, usize, String, String)>) {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                scan_directory(&path, violations);
            } else if path.extension().is_some_and(|ext| ext == "rs") {
                scan_file(&path, violations);
            }
        }
    }

    fn scan_file(path: &Path, violations: &mut Vec<(String, usize, String, String)>) {
        let filename = path.file_name().unwrap_or_default().to_string_lossy().to_string();
        if ALLOWLIST.iter().any(|allowed| filename.contains(allowed)) {
            return;
        }
        let Ok(content) = fs::read_to_string(path) else {
            return;
        };

        let mut in_tests = false;
        for (idx, line) in content.lines().enumerate() {
            if line.contains("#[cfg(test)]") {
                // Tests may print fixture data.
                in_tests = true;
            }
            if in_tests || !line.contains("tracing::") {
                continue;
            }
            for pattern in SENSITIVE_PATTERNS {
                if line.contains(pattern) {
                    violations.push((
                        path.display().to_string(),
                        idx + 1,
                        line.to_string(),
                        pattern.to_string(),
                    ));
                }
            }
        }
    }
}
