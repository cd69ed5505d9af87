use std::path::{Path, PathBuf};

use sandbox::ExecRequest;

/// Launcher used inside the sandbox to start the command from a clean environment.
const ENV_LAUNCHER: &str = "/usr/bin/env";

/// Fully resolved invocation of the sandbox executable.
///
/// Layout:
/// `<proot> -R <rootfs> -w <work_dir> [-b <bind>]... /usr/bin/env -i <default env...> <overlay...> <program> <args...>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn build(
        binary: &Path,
        rootfs: &Path,
        default_env: &[String],
        request: &ExecRequest<'_>,
    ) -> Self {
        let mut args = Vec::with_capacity(
            6 + request.binds.len() * 2
                + default_env.len()
                + request.env.len()
                + request.args.len(),
        );
        args.push("-R".to_string());
        args.push(rootfs.display().to_string());
        args.push("-w".to_string());
        args.push(request.work_dir.to_string());
        for bind in request.binds {
            args.push("-b".to_string());
            args.push(bind.clone());
        }
        args.push(ENV_LAUNCHER.to_string());
        args.push("-i".to_string());
        args.extend(default_env.iter().cloned());
        args.extend(request.env.iter().map(|(k, v)| format!("{k}={v}")));
        args.push(request.program.to_string());
        args.extend(request.args.iter().cloned());

        Self {
            program: binary.to_path_buf(),
            args,
        }
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.display().to_string());
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request<'a>(
        args: &'a [String],
        binds: &'a [String],
        env: &'a [(&'a str, &'a str)],
    ) -> ExecRequest<'a> {
        ExecRequest {
            program: "/bin/bash",
            args,
            binds,
            work_dir: "/project",
            env,
        }
    }

    #[test]
    fn build_full_layout() {
        let args = vec!["-c".to_string(), "bash gradlew tasks".to_string()];
        let binds = vec![
            "/storage/Documents".to_string(),
            "/data/ws/abc:/project".to_string(),
        ];
        let env = [("GRADLE_OPTS", "-Djava.io.tmpdir=/alt-tmp")];
        let default_env = vec!["HOME=/root".to_string(), "PATH=/usr/bin:/bin".to_string()];

        let spec = CommandSpec::build(
            Path::new("/lib/libproot.so"),
            Path::new("/data/rootfs"),
            &default_env,
            &request(&args, &binds, &env),
        );

        assert_eq!(spec.program, PathBuf::from("/lib/libproot.so"));
        assert_eq!(
            spec.args,
            vec![
                "-R",
                "/data/rootfs",
                "-w",
                "/project",
                "-b",
                "/storage/Documents",
                "-b",
                "/data/ws/abc:/project",
                "/usr/bin/env",
                "-i",
                "HOME=/root",
                "PATH=/usr/bin:/bin",
                "GRADLE_OPTS=-Djava.io.tmpdir=/alt-tmp",
                "/bin/bash",
                "-c",
                "bash gradlew tasks",
            ]
        );
    }

    #[test]
    fn build_without_binds_or_env() {
        let args = vec!["-v".to_string()];
        let spec = CommandSpec::build(
            Path::new("proot"),
            Path::new("/r"),
            &[],
            &request(&args, &[], &[]),
        );
        assert_eq!(
            spec.args,
            vec!["-R", "/r", "-w", "/project", "/usr/bin/env", "-i", "/bin/bash", "-v"]
        );
    }

    #[test]
    fn binds_keep_caller_order() {
        let binds = vec!["/b".to_string(), "/a".to_string(), "/b".to_string()];
        let spec = CommandSpec::build(
            Path::new("proot"),
            Path::new("/r"),
            &[],
            &request(&[], &binds, &[]),
        );
        let bound: Vec<&str> = spec
            .args
            .windows(2)
            .filter(|w| w[0] == "-b")
            .map(|w| w[1].as_str())
            .collect();
        assert_eq!(bound, vec!["/b", "/a", "/b"]);
    }

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec {
            program: PathBuf::from("proot"),
            args: vec!["-R".into(), "/r".into()],
        };
        assert_eq!(spec.display(), "proot -R /r");
    }
}
