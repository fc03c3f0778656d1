// src/banner.rs

/// Prints the application startup banner to the console.
pub fn print_banner() {
    let banner = r#"
                 _                                           _
 ____  _____ ___| |_ ____ _____     ____ _____ ____   ___  _| |_ ___
|  _ \| ___ (___   _) ___|____ |   / ___) ___ |  _ \ / _ \(_   _)___)
| |_| | ____|   | || |   / ___ |  | |   | ____| |_| | |_| | | ||___ |
|  __/|_____)    \__)_|  \_____|  |_|   |_____)  __/ \___/   \__|___/
|_|                                           |_|

    OpenPetra Report Jobs & Gift Receipts
"#;
    println!("{}", banner);
}
