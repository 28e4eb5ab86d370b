//! End-to-end tests: sample programs run under the sandbox.
//!
//! The library and the C samples are built on first use, with `cargo build -p strictbox` and `make -C samples`.

#[cfg(test)]
mod tests {
    use std::env;
    use std::io::Write;
    use std::os::unix::process::ExitStatusExt;
    use std::path::{Path, PathBuf};
    use std::process::{Command, Output, Stdio};
    use std::sync::OnceLock;

    const SENTINEL: &str = "<<entering SECCOMP mode>>";
    const SIGKILL: i32 = 9;

    fn workspace() -> &'static Path {
        Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."))
    }

    /// Path of the library, built once per test run.
    fn library() -> &'static Path {
        static LIBRARY: OnceLock<PathBuf> = OnceLock::new();
        LIBRARY.get_or_init(|| {
            let cargo = env::var("CARGO").unwrap_or_else(|_| "cargo".to_owned());
            let status = Command::new(cargo)
                .args(["build", "-p", "strictbox"])
                .current_dir(workspace())
                .status()
                .expect("Failed to run cargo");
            assert!(status.success(), "Failed to build the library");

            let target = env::var_os("CARGO_TARGET_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| workspace().join("target"));
            target.join("debug/libstrictbox.so")
        })
    }

    /// Path of a sample program, the samples being built once per test run.
    fn sample(name: &str) -> PathBuf {
        static SAMPLES: OnceLock<PathBuf> = OnceLock::new();
        let dir = SAMPLES.get_or_init(|| {
            let dir = workspace().join("samples");
            let status = Command::new("make")
                .arg("-C")
                .arg(&dir)
                .status()
                .expect("Failed to run make");
            assert!(status.success(), "Failed to build the samples");
            dir
        });
        dir.join(name)
    }

    fn sandboxed_program(program: impl AsRef<std::ffi::OsStr>) -> Command {
        let mut command = Command::new(program);
        command.env("LD_PRELOAD", library()).env_remove("STRICTBOX_LOG");
        command
    }

    fn sandboxed(name: &str) -> Command {
        sandboxed_program(sample(name))
    }

    /// The output of a sandboxed program, without the line announcing strict mode.
    fn program_output(stream: &[u8]) -> String {
        let text = String::from_utf8_lossy(stream);
        let mut lines = text.split_inclusive('\n');
        assert_eq!(lines.next().map(str::trim_end), Some(SENTINEL));
        lines.collect()
    }

    fn run(command: &mut Command) -> Output {
        command.output().expect("Failed to execute process")
    }

    #[test]
    fn library_loads_into_any_program() {
        let output = run(&mut sandboxed_program("/bin/true"));
        assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
        assert_eq!(program_output(&output.stdout), "");
        assert_eq!(program_output(&output.stderr), "");
    }

    #[test]
    fn hello() {
        let output = run(&mut sandboxed("hello"));
        assert!(output.status.success());
        assert_eq!(program_output(&output.stdout), "hi there\n");
        assert_eq!(program_output(&output.stderr), "");
    }

    #[test]
    fn exit_status_is_preserved() {
        let output = run(sandboxed("status").arg("7"));
        assert_eq!(output.status.code(), Some(7));
    }

    #[test]
    fn stdin_is_read_from_the_start() {
        let mut child = sandboxed("echo")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("Failed to execute process");
        child
            .stdin
            .take()
            .unwrap()
            .write_all(b"first line\nsecond line\n")
            .unwrap();

        let output = child.wait_with_output().unwrap();
        assert!(output.status.success());
        assert_eq!(program_output(&output.stdout), "first line\nsecond line\n");
    }

    #[test]
    fn allocations_need_no_syscalls() {
        let output = run(&mut sandboxed("alloc"));
        assert!(output.status.success());
        assert_eq!(
            program_output(&output.stdout),
            "realloc: grown\ncalloc: 0\nposix_memalign: 0 0\nusable: 1\nhuge: null\n"
        );
    }

    #[test]
    fn constructors_run_in_strict_mode() {
        let output = run(&mut sandboxed("ctor"));
        assert!(output.status.success());
        assert_eq!(program_output(&output.stdout), "constructor\nset by constructor\n");
    }

    #[test]
    fn forbidden_syscall_kills_the_program() {
        let output = run(&mut sandboxed("forbidden"));
        assert_eq!(output.status.signal(), Some(SIGKILL));
        assert_eq!(program_output(&output.stdout), "before\n");
    }

    #[test]
    fn invalid_heap_size_falls_back_to_default() {
        let output = run(sandboxed("hello").env("STRICTBOX_HEAPSIZE", "lots"));
        assert!(output.status.success());
        assert_eq!(program_output(&output.stdout), "hi there\n");
    }

    #[test]
    fn failed_heap_reservation_is_reported() {
        let output = run(sandboxed("hello").env("STRICTBOX_HEAPSIZE", "0"));
        assert_eq!(output.status.code(), Some(123));
        assert!(output.stdout.is_empty());
    }

    #[test]
    fn invalid_frees_are_always_reported() {
        let output = run(sandboxed("badfree").env("STRICTBOX_LOG", "off"));
        assert!(output.status.success());
        assert_eq!(program_output(&output.stdout), "still running\n");

        let diagnostics = program_output(&output.stderr);
        assert_eq!(diagnostics.matches("Invalid free at 0x").count(), 2, "{diagnostics}");
    }
}
