//! Line-oriented chat console
//!
//! Reads commands from stdin, prints whatever the server sends.

use std::time::Duration;

use chrono::Local;
use huddle_net::dispatcher::{validate_name, MAX_NAME_LEN};
use huddle_net::protocol::{ChatText, ErrorReply, Presence, RoomRef};
use huddle_net::{Client, Message, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::debug;

/// How often an idle console pings the server so it is not timed out
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

const HELP: &str = "\
commands:
  /join ROOM        switch to ROOM
  /leave [ROOM]     leave the current room
  /msg USER TEXT    private message
  /users            who is online
  /rooms            list rooms
  /ping             check the server is there
  /quit             leave
anything else is sent to the current room";

/// A parsed input line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join(String),
    Leave(Option<String>),
    Msg { to: String, text: String },
    Users,
    Rooms,
    Ping,
    Quit,
    Help,
    Say(String),
}

fn room_arg(args: &str, usage: &str) -> std::result::Result<String, String> {
    if args.is_empty() || args.contains(char::is_whitespace) {
        return Err(usage.to_string());
    }
    validate_name("room", args).map_err(|_| {
        format!(
            "invalid room name {:?} (1-{} characters, no spaces)",
            args, MAX_NAME_LEN
        )
    })?;
    Ok(args.to_string())
}

/// Parse one line of input. `Ok(None)` for a blank line, `Err` carries a
/// usage hint.
pub fn parse(line: &str) -> std::result::Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };

    let (verb, args) = match rest.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb, args.trim()),
        None => (rest, ""),
    };

    let command = match verb {
        "join" => Command::Join(room_arg(args, "usage: /join ROOM")?),
        "leave" if args.is_empty() => Command::Leave(None),
        "leave" => Command::Leave(Some(room_arg(args, "usage: /leave [ROOM]")?)),
        "msg" => match args.split_once(char::is_whitespace) {
            Some((to, text)) if !text.trim().is_empty() => Command::Msg {
                to: to.to_string(),
                text: text.trim().to_string(),
            },
            _ => return Err("usage: /msg USER TEXT".into()),
        },
        "users" => Command::Users,
        "rooms" => Command::Rooms,
        "ping" => Command::Ping,
        "quit" | "exit" => Command::Quit,
        "help" => Command::Help,
        other => return Err(format!("unknown command /{} (try /help)", other)),
    };
    Ok(Some(command))
}

/// What the console knows about its own session.
///
/// The current room is only learned from the server's `RoomJoin`
/// confirmations, so it is right whatever the server's default room is.
#[derive(Debug, Default)]
pub struct ConsoleState {
    room: Option<String>,
    /// A `/join` the server has not confirmed yet
    joining: Option<String>,
    pings_requested: usize,
}

impl ConsoleState {
    pub fn room(&self) -> Option<&str> {
        self.room.as_deref()
    }

    /// Track a message from the server. Returns false for messages the
    /// user should not see.
    pub fn observe(&mut self, msg: &Message) -> bool {
        match msg {
            Message::RoomJoin(RoomRef { room }) => {
                if self.joining.as_deref() == Some(room.as_str()) {
                    self.joining = None;
                }
                self.room = Some(room.clone());
            }
            Message::RoomLeave(RoomRef { room }) => {
                if self.room.as_deref() == Some(room.as_str()) {
                    self.room = None;
                }
            }
            Message::Heartbeat(_) => {
                if self.pings_requested == 0 {
                    return false;
                }
                self.pings_requested -= 1;
            }
            _ => {}
        }
        true
    }

    pub fn join_requested(&mut self, room: &str) {
        self.joining = Some(room.to_string());
    }

    pub fn ping_requested(&mut self) {
        self.pings_requested += 1;
    }

    /// The room `/leave [ROOM]` should leave. The server drops sessions
    /// that leave a room they are not in, so anything doubtful is refused
    /// here. On success the room is forgotten right away, so a quick
    /// second `/leave` is refused too.
    pub fn take_leave_target(
        &mut self,
        requested: Option<String>,
    ) -> std::result::Result<String, String> {
        if let Some(pending) = &self.joining {
            return Err(format!("still joining #{}, try again", pending));
        }
        let Some(current) = self.room.take() else {
            return Err("not in a room".into());
        };
        match requested {
            Some(requested) if requested != current => {
                let refusal = format!("not in #{} (you are in #{})", requested, current);
                self.room = Some(current);
                Err(refusal)
            }
            _ => Ok(current),
        }
    }
}

fn clock(chat: &ChatText) -> String {
    chat.timestamp.with_timezone(&Local).format("%H:%M:%S").to_string()
}

/// Text to show for a server message, if any
pub fn render(msg: &Message) -> Option<String> {
    let line = match msg {
        Message::Join(Presence {
            sender, room: None, ..
        }) => format!("* logged in as {}", sender),
        Message::Join(Presence {
            sender,
            room: Some(room),
            ..
        }) => format!("* {} joined #{}", sender, room),
        Message::Leave(Presence { sender, room, .. }) => match room {
            Some(room) => format!("* {} left #{}", sender, room),
            None => format!("* {} left", sender),
        },
        Message::RoomJoin(RoomRef { room }) => format!("* now in #{}", room),
        Message::RoomLeave(RoomRef { room }) => format!("* left #{}", room),
        Message::Broadcast(chat) => format!(
            "[{}] #{} <{}> {}",
            clock(chat),
            chat.receiver.as_deref().unwrap_or("?"),
            chat.sender,
            chat.content
        ),
        Message::Private(chat) => format!(
            "[{}] {} -> {}: {}",
            clock(chat),
            chat.sender,
            chat.receiver.as_deref().unwrap_or("?"),
            chat.content
        ),
        Message::UserList(list) => format!("* online: {}", list.users.join(", ")),
        Message::RoomList(list) => {
            let rooms: Vec<String> = list
                .rooms
                .iter()
                .map(|r| format!("#{} ({})", r.name, r.members))
                .collect();
            format!("* rooms: {}", rooms.join(", "))
        }
        Message::Error(ErrorReply { code, message }) => format!("! {:?}: {}", code, message),
        Message::Heartbeat(_) => "* pong".to_string(),
        Message::UserListRequest | Message::RoomListRequest => return None,
    };
    Some(line)
}

/// Log in as `name` and run until the user quits or the server goes away
pub async fn run(mut client: Client, name: &str) -> Result<()> {
    client.join(name).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await;

    let mut state = ConsoleState::default();

    loop {
        tokio::select! {
            incoming = client.next_message() => {
                let Some(msg) = incoming else {
                    println!("* disconnected");
                    return Ok(());
                };
                if !state.observe(&msg) {
                    continue;
                }
                if let Some(line) = render(&msg) {
                    println!("{}", line);
                }
            }

            line = lines.next_line() => {
                let Some(line) = line? else {
                    client.quit().await?;
                    return Ok(());
                };
                let command = match parse(&line) {
                    Ok(Some(command)) => command,
                    Ok(None) => continue,
                    Err(usage) => {
                        println!("! {}", usage);
                        continue;
                    }
                };

                match command {
                    Command::Join(target) => {
                        state.join_requested(&target);
                        client.join_room(&target).await?;
                    }
                    Command::Leave(target) => match state.take_leave_target(target) {
                        Ok(room) => client.leave_room(&room).await?,
                        Err(refusal) => println!("! {}", refusal),
                    },
                    Command::Msg { to, text } => client.private_message(&to, &text).await?,
                    Command::Users => client.list_users().await?,
                    Command::Rooms => client.list_rooms().await?,
                    Command::Ping => {
                        state.ping_requested();
                        client.heartbeat().await?;
                    }
                    Command::Help => println!("{}", HELP),
                    Command::Say(text) => client.say(&text).await?,
                    Command::Quit => {
                        client.quit().await?;
                        return Ok(());
                    }
                }
            }

            _ = keepalive.tick() => {
                debug!("Sending keepalive");
                client.heartbeat().await?;
            }
        }
    }
}
