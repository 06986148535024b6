//! Tiny CLI that bcrypt-hashes a password for pasting into a config file's
//! `users:` list.

use std::env;
use std::process::ExitCode;

use ferrodb::acl::hash_password;

fn main() -> ExitCode {
    let args: Vec<String> = env::args().collect();
    let password = match args.get(1) {
        Some(password) => password,
        None => {
            eprintln!("usage: ferrodb-hash <password>");
            return ExitCode::FAILURE;
        }
    };

    match hash_password(password) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
