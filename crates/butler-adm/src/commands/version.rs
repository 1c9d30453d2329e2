//! Version command

/// Line printed by `butleradm version`
pub fn version_line() -> String {
    format!("butleradm version v{}", env!("CARGO_PKG_VERSION"))
}

/// Print version information
pub fn run() {
    println!("{}", version_line());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_line_names_binary() {
        assert!(version_line().starts_with("butleradm version v"));
    }
}
