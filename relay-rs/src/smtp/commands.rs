use crate::error::{RelayError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum SmtpCommand {
    Helo(String),
    Ehlo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    Rset,
    Quit,
    Noop,
    Unknown(String),
}

impl SmtpCommand {
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();
        if line.is_empty() {
            return Err(RelayError::SmtpProtocol("Empty command".to_string()));
        }

        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb, args.trim()),
            None => (line, ""),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" => Ok(SmtpCommand::Helo(Self::require_domain("HELO", args)?)),
            "EHLO" => Ok(SmtpCommand::Ehlo(Self::require_domain("EHLO", args)?)),
            "MAIL" => Ok(SmtpCommand::MailFrom(Self::parse_path("FROM:", args)?)),
            "RCPT" => {
                let to = Self::parse_path("TO:", args)?;
                if to.is_empty() {
                    return Err(RelayError::SmtpProtocol("Empty recipient".to_string()));
                }
                Ok(SmtpCommand::RcptTo(to))
            }
            "DATA" => Ok(SmtpCommand::Data),
            "RSET" => Ok(SmtpCommand::Rset),
            "QUIT" => Ok(SmtpCommand::Quit),
            "NOOP" => Ok(SmtpCommand::Noop),
            other => Ok(SmtpCommand::Unknown(other.to_string())),
        }
    }

    fn require_domain(verb: &str, args: &str) -> Result<String> {
        if args.is_empty() {
            return Err(RelayError::SmtpProtocol(format!("{} requires domain", verb)));
        }
        Ok(args.to_string())
    }

    /// `FROM:<path> [params]` / `TO:<path> [params]`, parameters ignored
    fn parse_path(prefix: &str, args: &str) -> Result<String> {
        let head = args.get(..prefix.len()).unwrap_or("");
        if !head.eq_ignore_ascii_case(prefix) {
            return Err(RelayError::SmtpProtocol(format!(
                "Invalid {} syntax",
                prefix.trim_end_matches(':')
            )));
        }

        let rest = args[prefix.len()..].trim_start();
        let path = match rest.strip_prefix('<') {
            Some(inner) => inner
                .split_once('>')
                .map(|(path, _)| path)
                .ok_or_else(|| RelayError::SmtpProtocol("Unterminated path".to_string()))?,
            None => rest.split_whitespace().next().unwrap_or(""),
        };

        Ok(path.trim().to_string())
    }
}
