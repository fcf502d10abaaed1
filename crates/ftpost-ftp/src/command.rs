//! Control-connection command lines.

/// Longest accepted command line, excluding the CRLF terminator.
pub const MAX_LINE_LEN: usize = 2048;

/// One parsed command: upper-cased verb plus its raw argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub verb: String,
    pub arg: String,
}

impl Command {
    /// Parse a line with its terminator already stripped or not.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let (verb, arg) = match line.split_once(' ') {
            Some((verb, arg)) => (verb, arg),
            None => (line, ""),
        };
        Command {
            verb: verb.trim().to_ascii_uppercase(),
            arg: arg.to_string(),
        }
    }

    pub fn has_arg(&self) -> bool {
        !self.arg.trim().is_empty()
    }

    /// Commands accepted before login completes.
    pub fn allowed_before_login(&self) -> bool {
        matches!(
            self.verb.as_str(),
            "USER" | "PASS" | "QUIT" | "NOOP" | "SYST" | "FEAT" | "HELP" | "OPTS" | "AUTH"
                | "PBSZ" | "PROT"
        )
    }

    /// Commands that move file data and so fall under `PROT P`.
    pub fn uses_data_channel(&self) -> bool {
        matches!(
            self.verb.as_str(),
            "STOR" | "APPE" | "STOU" | "RETR" | "LIST" | "NLST" | "MLSD"
        )
    }
}

/// Strip leading `ls`-style options (`LIST -la /dir`) from a listing argument.
pub fn listing_path(arg: &str) -> &str {
    let mut rest = arg.trim();
    while rest.starts_with('-') {
        rest = match rest.split_once(' ') {
            Some((_, tail)) => tail.trim_start(),
            None => "",
        };
    }
    rest
}
