//! Command line argument splitting.

/// Split a raw command buffer into arguments.
///
/// Spaces separate arguments. A double quote toggles literal-space capture
/// and is not part of the argument. Every space outside quotes ends the
/// current argument, so consecutive spaces produce empty arguments; the
/// trailing argument is kept only if non-empty. Blank input yields no
/// arguments.
pub fn split_arguments(input: &str) -> Vec<String> {
    let mut arguments = Vec::new();
    if input.trim().is_empty() {
        return arguments;
    }

    let mut current = String::new();
    let mut quoted = false;

    for c in input.chars() {
        match c {
            '"' => quoted = !quoted,
            ' ' if !quoted => arguments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }

    if !current.is_empty() {
        arguments.push(current);
    }

    arguments
}
