use std::fmt::Write as _;

use crate::program::Program;

/// Human-readable listing of a resolved program in program order.
pub fn format_program(target: &str, program: &Program) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Target:       {target}");
    let _ = writeln!(out, "Definitions:  {}", program.len());

    for (idx, entry) in program.definitions.iter().enumerate() {
        let refs: Vec<String> = entry
            .closure
            .references
            .iter()
            .map(|(local, id)| format!("{local}={id}"))
            .collect();
        if refs.is_empty() {
            let _ = writeln!(out, "  {idx}. {}", entry.identity);
        } else {
            let _ = writeln!(out, "  {idx}. {}  refs: {}", entry.identity, refs.join(" "));
        }
    }
    out
}

pub fn print_program(target: &str, program: &Program) {
    print!("{}", format_program(target, program));
}
