//! Line-oriented controls read from stdin while in a room

use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    ToggleMute,
    Volume(u8),
    ResumeAudio,
    Foreground,
    Stats,
    Participants,
    Help,
    Quit,
}

pub const HELP: &str = "\
commands:
  m        toggle mute
  v <0-100> set playback volume
  r        resume audio playback
  f        back in foreground (restart unhealthy links)
  p        list participants
  s        print session stats
  q        leave the room";

impl FromStr for Control {
    type Err = String;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let mut parts = line.split_whitespace();
        let Some(cmd) = parts.next() else {
            return Err("empty command".to_string());
        };
        let control = match cmd {
            "m" | "mute" => Self::ToggleMute,
            "v" | "volume" => {
                let value = parts
                    .next()
                    .ok_or_else(|| "volume needs a value".to_string())?;
                let percent: u16 = value
                    .parse()
                    .map_err(|_| format!("invalid volume: {value}"))?;
                Self::Volume(u8::try_from(percent.min(100)).unwrap_or(100))
            }
            "r" | "resume" => Self::ResumeAudio,
            "f" | "foreground" => Self::Foreground,
            "s" | "stats" => Self::Stats,
            "p" | "participants" => Self::Participants,
            "h" | "help" | "?" => Self::Help,
            "q" | "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command: {other}")),
        };
        if parts.next().is_some() {
            return Err(format!("too many arguments for {cmd}"));
        }
        Ok(control)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_controls() {
        assert_eq!("m".parse(), Ok(Control::ToggleMute));
        assert_eq!("  volume 40 ".parse(), Ok(Control::Volume(40)));
        assert_eq!("v 250".parse(), Ok(Control::Volume(100)));
        assert_eq!("q".parse(), Ok(Control::Quit));
        assert_eq!("f".parse(), Ok(Control::Foreground));
    }

    #[test]
    fn test_reject_bad_input() {
        assert!("".parse::<Control>().is_err());
        assert!("v".parse::<Control>().is_err());
        assert!("v -3".parse::<Control>().is_err());
        assert!("m now".parse::<Control>().is_err());
        assert!("dance".parse::<Control>().is_err());
    }
}
