//! Parser for the JavaScript-ish blob some gateways return instead of XML:
//!
//! ```text
//! var respStatus = "Challenge";
//! var respMsg = "<prompt>";
//! thisForm.inputStr.value = "<inputStr>";
//! ```
//!
//! Parsing is anchored on the three literal line prefixes. Each line must end
//! with `";` followed by a newline. The strings are not unescaped; the
//! protocol only emits bare ASCII.

const PRE_STATUS: &str = "var respStatus = \"";
const PRE_PROMPT: &str = "var respMsg = \"";
const PRE_INPUT_STR: &str = "thisForm.inputStr.value = \"";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResponse {
    /// The gateway wants another round of interactive input.
    Challenge { prompt: String, input_str: String },
    /// The gateway reported an error; `message` is the human-readable text.
    Error { message: String },
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("missing `{0}...\"` line")]
    MissingLine(&'static str),
    #[error("unrecognised response status `{0}`")]
    UnknownStatus(String),
    #[error("trailing data after script")]
    TrailingData,
}

pub fn parse(body: &str) -> Result<ScriptResponse, ScriptError> {
    let (status, rest) = take_line(body, PRE_STATUS)?;
    let challenge = match status {
        "Challenge" => true,
        "Error" => false,
        other => return Err(ScriptError::UnknownStatus(other.to_owned())),
    };

    let (prompt, rest) = take_line(rest, PRE_PROMPT)?;

    if challenge {
        let (input_str, rest) = take_line(rest, PRE_INPUT_STR)?;
        ensure_only_whitespace(rest)?;

        return Ok(ScriptResponse::Challenge {
            prompt: prompt.to_owned(),
            input_str: input_str.to_owned(),
        });
    }

    // An error response may omit the `inputStr` line entirely.
    if let Ok((_, rest)) = take_line(rest, PRE_INPUT_STR) {
        ensure_only_whitespace(rest)?;
    } else {
        ensure_only_whitespace(rest)?;
    }

    Ok(ScriptResponse::Error {
        message: prompt.to_owned(),
    })
}

/// Consumes leading whitespace, the literal `prefix` and a `"<value>";`-shaped
/// remainder up to the next newline. Returns the value and the unparsed rest.
fn take_line<'a>(input: &'a str, prefix: &'static str) -> Result<(&'a str, &'a str), ScriptError> {
    let input = input.trim_start();

    let Some(line_start) = input.strip_prefix(prefix) else {
        return Err(ScriptError::MissingLine(prefix));
    };

    let Some(newline) = line_start.find('\n') else {
        return Err(ScriptError::MissingLine(prefix));
    };

    let (line, rest) = line_start.split_at(newline);

    let Some(value) = line.strip_suffix("\";") else {
        return Err(ScriptError::MissingLine(prefix));
    };

    Ok((value, rest))
}

fn ensure_only_whitespace(rest: &str) -> Result<(), ScriptError> {
    if !rest.trim_start().is_empty() {
        return Err(ScriptError::TrailingData);
    }

    Ok(())
}
