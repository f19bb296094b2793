//! Command line grammar: classification and parsing.
//!
//! Input lines fall into three classes:
//! - `/PRIVMSG <text>` keeps everything after the fixed prefix verbatim, so
//!   embedded whitespace in chat text survives. A bare line with no leading
//!   `/` is wrapped the same way.
//! - `/msg <user> <text>` is a structured parse into (target, remainder).
//! - Everything else is whitespace-tokenized and dispatched on the
//!   (command, argument count) pair; unmatched shapes are invalid.

/// Marker that starts every command line.
pub const COMMAND_MARKER: char = '/';

/// A parsed input line. Borrowed slices point into the raw line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command<'a> {
    Help(Option<&'a str>),
    Who(Option<&'a str>),
    List,
    Join(&'a str),
    Leave(&'a str),
    Current(&'a str),
    Nick(Option<&'a str>),
    Whois(&'a str),
    Msg { target: &'a str, text: &'a str },
    /// Chat text routed to the sender's current channel.
    Chat(&'a str),
    Exit,
    Invalid,
}

impl<'a> Command<'a> {
    /// Parse a single line (already stripped of its terminator).
    /// Command words are case-sensitive.
    pub fn parse(line: &'a str) -> Command<'a> {
        if !line.starts_with(COMMAND_MARKER) {
            return Command::Chat(line);
        }

        // Raw-remainder form: payload is never tokenized.
        if let Some(text) = line.strip_prefix("/PRIVMSG ") {
            return Command::Chat(text);
        }
        if line == "/PRIVMSG" {
            return Command::Chat("");
        }

        // Structured form: /msg <user> <text...>
        if line == "/msg" || line.starts_with("/msg ") {
            let rest = line["/msg".len()..].trim_start();
            let Some((target, text)) = rest.split_once(char::is_whitespace) else {
                return Command::Invalid;
            };
            let text = text.trim_start();
            if target.is_empty() || text.is_empty() {
                return Command::Invalid;
            }
            return Command::Msg { target, text };
        }

        let tokens: Vec<&'a str> = line.split_whitespace().collect();
        match (tokens[0], tokens.len()) {
            ("/help", 1) => Command::Help(None),
            ("/help", 2) => Command::Help(Some(tokens[1])),
            ("/who", 1) => Command::Who(None),
            ("/who", 2) => Command::Who(Some(tokens[1])),
            ("/list", 1) => Command::List,
            ("/join", 2) => Command::Join(tokens[1]),
            ("/leave", 2) => Command::Leave(tokens[1]),
            ("/current", 2) => Command::Current(tokens[1]),
            ("/nick", 1) => Command::Nick(None),
            ("/nick", 2) => Command::Nick(Some(tokens[1])),
            ("/whois", 2) => Command::Whois(tokens[1]),
            ("/exit", 1) => Command::Exit,
            _ => Command::Invalid,
        }
    }
}

/// Static help text, CRLF-terminated per line.
pub fn help_text(topic: Option<&str>) -> String {
    let lines: &[&str] = match topic {
        None => &[
            "List of commands",
            "/help -- shows valid commands",
            "/nick <nickname> -- show/change username",
            "/who <channel> -- shows users",
            "/list -- shows channels on server",
            "/exit -- logoff",
            "/whois <username> -- info about user",
            "/join <channel> -- join channel",
            "/leave <channel> -- leave channel",
            "/current <channel> -- change current channel",
            "/msg <user> <message> -- send user private message",
            "/help <command> -- more info on command",
        ],
        Some("nick") => &[
            "Command: /nick",
            "Arguments: <nickname> (optional)",
            "Description: changes your username to <nickname>.",
            "If <nickname> is not provided, your current username is echoed.",
        ],
        Some("who") => &[
            "Command: /who",
            "Arguments: <channel> (optional)",
            "Description: shows all users on the server.",
            "When a channel is provided, shows the users in that channel.",
        ],
        Some("list") => &[
            "Command: /list",
            "Arguments: none",
            "Description: shows the channels currently on the server.",
        ],
        Some("exit") => &[
            "Command: /exit",
            "Arguments: none",
            "Description: logs you off the server.",
        ],
        Some("whois") => &[
            "Command: /whois",
            "Arguments: <username> (required)",
            "Description: displays basic info about <username>.",
            "Ex: /whois billy",
        ],
        Some("join") => &[
            "Command: /join",
            "Arguments: <channel> (required)",
            "Description: places you in <channel>, creating it if needed.",
            "The most recently joined channel becomes your current channel.",
            "Channel names must start with # and contain no spaces.",
            "Ex: /join #channel_one",
        ],
        Some("leave") => &[
            "Command: /leave",
            "Arguments: <channel> (required)",
            "Description: takes you out of <channel>.",
            "You must be in a channel in order to leave it.",
            "If you are the last member, the channel is deleted.",
            "Ex: /leave #channel_one",
        ],
        Some("current") => &[
            "Command: /current",
            "Arguments: <channel> (required)",
            "Description: switches your current channel.",
            "You must already be in <channel>.",
            "Ex: /current #channel_one",
        ],
        Some("msg") => &[
            "Command: /msg",
            "Arguments: <user>, <message> (required)",
            "Description: sends private message <message> to <user>.",
            "Ex: /msg billy hi billybob!",
        ],
        Some(_) => &["Specified command does not exist. Type /help for list of commands"],
    };

    let mut out = String::new();
    for line in lines {
        out.push_str(line);
        out.push_str("\r\n");
    }
    out
}
