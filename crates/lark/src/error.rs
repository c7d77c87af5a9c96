use thiserror::Error;

/// Errors surfaced by [`crate::Interpreter::interpret`].
#[derive(Debug, Error)]
pub enum Error {
    /// One or more compile-time diagnostics, each already rendered in the
    /// `[line N] Error at '<lexeme>': <message>` form.
    #[error("{}", .0.join("\n"))]
    Compile(Vec<String>),

    /// A runtime failure. `trace` holds one entry per active call frame,
    /// innermost first, with consecutive duplicates collapsed into a
    /// `[^ line repeated N time(s)]` marker.
    #[error("{}", render_runtime(.message, .trace))]
    Runtime { message: String, trace: Vec<String> },
}

fn render_runtime(message: &str, trace: &[String]) -> String {
    let mut out = message.to_string();
    for line in trace {
        out.push('\n');
        out.push_str(line);
    }
    out
}

pub type Result<T> = std::result::Result<T, Error>;
