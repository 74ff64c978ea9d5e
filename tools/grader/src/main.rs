fn main() {
    match grader::run() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            eprintln!("{error}");
            std::process::exit(grader::EXIT_RUN_FAILED);
        }
    }
}
