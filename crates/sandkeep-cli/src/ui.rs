use colored::Colorize;

fn prefix() -> String {
    "[sandkeep]".bold().cyan().to_string()
}

/// Print an informational message: [sandkeep] message
pub fn info(msg: &str) {
    println!("{} {}", prefix(), msg);
}

/// Print a success message: [sandkeep] message (in green)
pub fn success(msg: &str) {
    println!("{} {}", prefix(), msg.green());
}

/// Print an error message: [sandkeep] ERROR: message (in red)
pub fn error(msg: &str) {
    eprintln!("{} {}", "[sandkeep]".bold().red(), msg.red());
}
