use std::borrow::Cow;

use shell_escape::unix::escape;

/// Quote `arg` for a POSIX shell so it is passed through as a single word.
pub fn quote(arg: &str) -> Cow<'_, str> {
    escape(Cow::Borrowed(arg))
}

/// Quote each argument and join with spaces.
pub fn join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
