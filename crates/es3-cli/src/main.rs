mod cli;

fn main() {
    let code = match cli::run_from_args() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("es3 error: {:#}", err);
            8
        }
    };
    std::process::exit(code);
}
