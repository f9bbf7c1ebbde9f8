//! A simulated host for unit tests: just enough of `lxc`, the guest's user
//! database, `ps`, `kill` and the subordinate id files to drive lxdev
//! end to end. Every command line is recorded.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::{self, Write};
use std::rc::Rc;

use serde_json::json;

use crate::container::ContainerDescriptor;
use crate::system::{CommandOutput, CommandRunner};

pub const SSH_KEY: &str = "ssh-rsa SSHKEYDATA /home/user/.ssh/id_rsa";

pub const RUNNING_TESTING_JSON: &str = r#"[
  {
    "name": "testing",
    "status": "Running",
    "state": {
      "network": {
        "eth0": {
          "addresses": [
            {"family": "inet", "address": "10.221.79.46"},
            {"family": "inet6", "address": "fe80::216:3eff:fe2b:1f1f"}
          ]
        },
        "lo": {
          "addresses": [{"family": "inet", "address": "127.0.0.1"}]
        }
      }
    },
    "devices": {
      "shared_folder_lxdev": {
        "path": "/home/testing/lxdev",
        "source": "/home/user/lxdev",
        "type": "disk"
      }
    },
    "snapshots": [
      {"name": "testing/provisioned", "created_at": "2019-03-28T12:05:31Z"}
    ]
  }
]"#;

pub fn testing_descriptor() -> ContainerDescriptor {
    ContainerDescriptor {
        name: "testing".to_string(),
        image: "ubuntu:bionic".to_string(),
        user: "testing".to_string(),
    }
}

struct FakeContainer {
    running: bool,
    devices: BTreeMap<String, (String, String)>,
    snapshots: Vec<String>,
    users: BTreeMap<String, (u32, u32)>,
    groups: BTreeMap<String, u32>,
    raw_idmap: String,
}

impl FakeContainer {
    fn new(running: bool) -> Self {
        FakeContainer {
            running,
            devices: BTreeMap::new(),
            snapshots: Vec::new(),
            users: BTreeMap::from([
                ("root".to_string(), (0, 0)),
                ("ubuntu".to_string(), (1000, 1000)),
            ]),
            groups: BTreeMap::from([("root".to_string(), 0), ("ubuntu".to_string(), 1000)]),
            raw_idmap: String::new(),
        }
    }

    fn free_uid(&self) -> u32 {
        (1000..)
            .find(|id| !self.users.values().any(|(uid, _)| uid == id))
            .unwrap_or(60000)
    }

    fn free_gid(&self) -> u32 {
        (1000..)
            .find(|id| !self.groups.values().any(|gid| gid == id))
            .unwrap_or(60000)
    }
}

struct FakeState {
    calls: Vec<String>,
    spawned: Vec<String>,
    overrides: HashMap<String, CommandOutput>,
    groups: String,
    programs: Vec<String>,
    engine_initialized: bool,
    shift: bool,
    images: Vec<String>,
    boot_ip: Option<String>,
    start_fails: bool,
    forwarders_die: bool,
    services: Vec<String>,
    subuid: Vec<String>,
    subgid: Vec<String>,
    containers: BTreeMap<String, FakeContainer>,
    processes: BTreeMap<u32, String>,
    next_pid: u32,
}

#[derive(Clone)]
pub struct FakeHost {
    state: Rc<RefCell<FakeState>>,
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn fail(status: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        status,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// Body of a `<<'EOS'` here-document.
fn heredoc(command: &str) -> String {
    let body = command.split_once('\n').map(|(_, rest)| rest).unwrap_or("");
    body.strip_suffix("\nEOS")
        .or_else(|| body.strip_suffix("EOS"))
        .unwrap_or(body)
        .to_string()
}

fn unquote(word: &str) -> String {
    match word.strip_prefix('\'').and_then(|w| w.strip_suffix('\'')) {
        Some(inner) => inner.replace(r"'\''", "'"),
        None => word.to_string(),
    }
}

/// Split one command line into words the way `sh` would for the simple
/// quoting lxdev emits: single quotes and backslash escapes.
fn shell_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut word = String::new();
    let mut in_word = false;
    let mut quoted = false;
    let mut chars = line.chars();
    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                quoted = !quoted;
                in_word = true;
            }
            '\\' if !quoted => {
                word.extend(chars.next());
                in_word = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                word.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        words.push(word);
    }
    words
}

impl FakeHost {
    pub fn new() -> Self {
        let programs = ["lxc", "redir", "ssh-add", "ssh"];
        FakeHost {
            state: Rc::new(RefCell::new(FakeState {
                calls: Vec::new(),
                spawned: Vec::new(),
                overrides: HashMap::new(),
                groups: "user adm sudo".to_string(),
                programs: programs.iter().map(|p| p.to_string()).collect(),
                engine_initialized: true,
                shift: false,
                images: vec!["ubuntu:bionic".to_string()],
                boot_ip: Some("10.221.79.46".to_string()),
                start_fails: false,
                forwarders_die: false,
                services: vec!["lxd.service".to_string()],
                subuid: vec!["lxd:100000:65536".to_string(), "root:100000:65536".to_string()],
                subgid: vec!["lxd:100000:65536".to_string(), "root:100000:65536".to_string()],
                containers: BTreeMap::new(),
                processes: BTreeMap::new(),
                next_pid: 4000,
            })),
        }
    }

    // --- scenario set-up ---

    /// Answer `command` (exactly as issued, including any `sudo`) with a
    /// canned result instead of the simulation.
    pub fn respond(&self, command: &str, status: i32, stdout: &str, stderr: &str) {
        self.state.borrow_mut().overrides.insert(
            command.to_string(),
            CommandOutput {
                status,
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        );
    }

    pub fn set_groups(&self, groups: &str) {
        self.state.borrow_mut().groups = groups.to_string();
    }

    pub fn remove_program(&self, program: &str) {
        self.state.borrow_mut().programs.retain(|p| p != program);
    }

    pub fn set_engine_initialized(&self, initialized: bool) {
        self.state.borrow_mut().engine_initialized = initialized;
    }

    pub fn enable_shift(&self) {
        self.state.borrow_mut().shift = true;
    }

    pub fn set_boot_ip(&self, ip: Option<&str>) {
        self.state.borrow_mut().boot_ip = ip.map(str::to_string);
    }

    pub fn fail_start(&self) {
        self.state.borrow_mut().start_fails = true;
    }

    pub fn forwarders_die(&self) {
        self.state.borrow_mut().forwarders_die = true;
    }

    pub fn set_services(&self, services: &[&str]) {
        self.state.borrow_mut().services = services.iter().map(|s| s.to_string()).collect();
    }

    /// Create (or replace) a container built from `image`.
    pub fn add_container(&self, name: &str, image: &str, running: bool) {
        let mut state = self.state.borrow_mut();
        if !state.images.iter().any(|i| i == image) {
            state.images.push(image.to_string());
        }
        state
            .containers
            .insert(name.to_string(), FakeContainer::new(running));
    }

    /// Add a guest user, pushing any account holding the same ids aside.
    pub fn add_guest_user(&self, container: &str, user: &str, uid: u32, gid: u32) {
        let mut state = self.state.borrow_mut();
        let Some(c) = state.containers.get_mut(container) else {
            return;
        };
        for (_, ids) in c.users.iter_mut() {
            if ids.0 == uid {
                *ids = (1500, 1500);
            }
        }
        for (_, id) in c.groups.iter_mut() {
            if *id == gid {
                *id = 1500;
            }
        }
        c.users.insert(user.to_string(), (uid, gid));
        c.groups.insert(user.to_string(), gid);
    }

    pub fn add_snapshot(&self, container: &str, snapshot: &str) {
        if let Some(c) = self.state.borrow_mut().containers.get_mut(container) {
            c.snapshots.push(snapshot.to_string());
        }
    }

    pub fn add_process(&self, pid: u32, args: &str) {
        self.state
            .borrow_mut()
            .processes
            .insert(pid, args.to_string());
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub fn spawned(&self) -> Vec<String> {
        self.state.borrow().spawned.clone()
    }

    pub fn processes(&self) -> Vec<(u32, String)> {
        self.state
            .borrow()
            .processes
            .iter()
            .map(|(pid, args)| (*pid, args.clone()))
            .collect()
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state.borrow().containers.contains_key(name)
    }

    pub fn guest_user(&self, container: &str, user: &str) -> Option<(u32, u32)> {
        self.state
            .borrow()
            .containers
            .get(container)
            .and_then(|c| c.users.get(user).copied())
    }

    pub fn devices(&self, container: &str) -> Vec<(String, String, String)> {
        self.state
            .borrow()
            .containers
            .get(container)
            .map(|c| {
                c.devices
                    .iter()
                    .map(|(name, (source, path))| (name.clone(), source.clone(), path.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn snapshots(&self, container: &str) -> Vec<String> {
        self.state
            .borrow()
            .containers
            .get(container)
            .map(|c| c.snapshots.clone())
            .unwrap_or_default()
    }

    pub fn raw_idmap(&self, container: &str) -> String {
        self.state
            .borrow()
            .containers
            .get(container)
            .map(|c| c.raw_idmap.clone())
            .unwrap_or_default()
    }

    // --- simulation ---

    fn simulate(&self, command: &str) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let command = command.strip_prefix("sudo ").unwrap_or(command);
        let first_line = command.lines().next().unwrap_or("");
        let words: Vec<&str> = first_line.split_whitespace().collect();

        let argv = shell_words(first_line);
        let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
        match argv.as_slice() {
            ["lxc", "config", "device", "add", name, link, "disk", source, path, ..] => {
                let source = source.trim_start_matches("source=").to_string();
                let path = path.trim_start_matches("path=").to_string();
                return Self::with_container(&mut state, name, |c| {
                    if c.devices.contains_key(*link) {
                        return fail(1, "Error: The device already exists");
                    }
                    c.devices.insert(link.to_string(), (source, path));
                    ok(format!("Device {} added to {}\n", link, name))
                });
            }
            ["lxc", "config", "device", "get", name, link, "source"] => {
                return Self::with_container(&mut state, name, |c| match c.devices.get(*link) {
                    Some((source, _)) => ok(format!("{}\n", source)),
                    None => fail(1, format!("Error: Device doesn't exist: {}", link)),
                });
            }
            _ => {}
        }

        match words.as_slice() {
            ["id", "-nG"] => ok(format!("{}\n", state.groups)),
            ["id", "-u"] => ok("1000\n"),
            ["id", "-g"] => ok("1000\n"),
            ["command", "-v", program] => {
                if state.programs.iter().any(|p| p == program) {
                    ok(format!("/usr/bin/{}\n", program))
                } else {
                    fail(1, "")
                }
            }
            ["ssh-add", "-L"] => ok(format!("{}\n", SSH_KEY)),
            ["ps", "axo", "pid,args"] => {
                let mut out = String::from("  PID COMMAND\n    1 /sbin/init\n");
                for (pid, args) in &state.processes {
                    out.push_str(&format!("{:>5} {}\n", pid, args));
                }
                ok(out)
            }
            ["kill", pid] => match pid.parse::<u32>().ok().and_then(|p| state.processes.remove(&p)) {
                Some(_) => ok(""),
                None => fail(1, format!("kill: ({}) - No such process", pid)),
            },
            ["cat", "/etc/subuid"] => ok(state.subuid.join("\n")),
            ["cat", "/etc/subgid"] => ok(state.subgid.join("\n")),
            ["tee", "-a", file, ..] => {
                let line = heredoc(command);
                match *file {
                    "/etc/subuid" => state.subuid.push(line.clone()),
                    "/etc/subgid" => state.subgid.push(line.clone()),
                    _ => {}
                }
                ok(line)
            }
            ["systemctl", "status", service] => {
                if state.services.iter().any(|s| s == service) {
                    ok("active (running)")
                } else {
                    fail(4, format!("Unit {} could not be found.", service))
                }
            }
            ["systemctl", "restart", _] => ok(""),
            ["lxc", "info"] => ok(format!(
                "config: {{}}\nenvironment:\n  kernel_features:\n    netnsid_getifaddrs: \"true\"\n    shiftfs: \"{}\"\n",
                state.shift
            )),
            ["lxc", "profile", "device", "list", "default"] => {
                if state.engine_initialized {
                    ok("eth0\nroot\n")
                } else {
                    ok("")
                }
            }
            ["lxc", "ls", "--format", "json", pattern] => {
                let pattern = unquote(pattern);
                let name = pattern.trim_start_matches('^').trim_end_matches('$');
                let listing = match state.containers.get(name) {
                    Some(c) => vec![container_json(name, c, state.boot_ip.as_deref())],
                    None => Vec::new(),
                };
                ok(serde_json::Value::Array(listing).to_string())
            }
            ["lxc", "init", image, name] => {
                if !state.images.iter().any(|i| i == image) {
                    fail(1, "Error: The requested image couldn't be found")
                } else if state.containers.contains_key(*name) {
                    fail(1, "Error: Add instance info to the database: This instance already exists")
                } else {
                    state
                        .containers
                        .insert(name.to_string(), FakeContainer::new(false));
                    ok(format!("Creating {}\n", name))
                }
            }
            ["lxc", "config", "set", name, "boot.autostart", "false"] => {
                Self::with_container(&mut state, name, |_| ok(""))
            }
            ["lxc", "config", "set", name, "raw.idmap", "-", ..] => {
                let body = heredoc(command);
                Self::with_container(&mut state, name, |c| {
                    c.raw_idmap = body;
                    ok("")
                })
            }
            ["lxc", "config", "get", name, "raw.idmap"] => {
                Self::with_container(&mut state, name, |c| ok(format!("{}\n", c.raw_idmap)))
            }
            ["lxc", "config", "device", "list", name] => Self::with_container(&mut state, name, |c| {
                ok(c.devices.keys().map(|k| format!("{}\n", k)).collect::<String>())
            }),
            ["lxc", "start", name] => {
                if state.start_fails {
                    return fail(1, "Error: Failed to run: forkstart");
                }
                Self::with_container(&mut state, name, |c| {
                    c.running = true;
                    ok("")
                })
            }
            ["lxc", "stop", name] => Self::with_container(&mut state, name, |c| {
                c.running = false;
                ok("")
            }),
            ["lxc", "delete", "--force", name] => {
                if state.containers.remove(*name).is_some() {
                    ok("")
                } else {
                    fail(1, "Error: not found")
                }
            }
            ["lxc", "delete", target] => {
                let Some((name, snapshot)) = target.split_once('/') else {
                    return fail(1, "Error: The instance is currently running");
                };
                Self::with_container(&mut state, name, |c| {
                    let before = c.snapshots.len();
                    c.snapshots.retain(|s| s != snapshot);
                    if c.snapshots.len() == before {
                        fail(1, "Error: not found")
                    } else {
                        ok("")
                    }
                })
            }
            ["lxc", "snapshot", name, snapshot] => Self::with_container(&mut state, name, |c| {
                if c.snapshots.iter().any(|s| s == snapshot) {
                    return fail(1, "Error: Snapshot already exists");
                }
                c.snapshots.push(snapshot.to_string());
                ok("")
            }),
            ["lxc", "restore", name, snapshot] => Self::with_container(&mut state, name, |c| {
                if c.snapshots.iter().any(|s| s == snapshot) {
                    ok("")
                } else {
                    fail(1, "Error: not found")
                }
            }),
            ["lxc", "exec", name, "--", ..] => {
                let guest_command = command
                    .split_once(" -- ")
                    .map(|(_, rest)| rest)
                    .unwrap_or("");
                Self::with_container(&mut state, name, |c| {
                    if !c.running {
                        return fail(1, "Error: Instance is not running");
                    }
                    guest(c, guest_command)
                })
            }
            _ => fail(127, format!("fake host: unsupported command: {}", command)),
        }
    }

    fn with_container(
        state: &mut FakeState,
        name: &str,
        f: impl FnOnce(&mut FakeContainer) -> CommandOutput,
    ) -> CommandOutput {
        match state.containers.get_mut(name) {
            Some(c) => f(c),
            None => fail(1, "Error: Instance not found"),
        }
    }
}

fn container_json(name: &str, c: &FakeContainer, boot_ip: Option<&str>) -> serde_json::Value {
    let network = match (c.running, boot_ip) {
        (true, Some(ip)) => json!({
            "eth0": {"addresses": [
                {"family": "inet", "address": ip},
                {"family": "inet6", "address": "fe80::1"}
            ]},
            "lo": {"addresses": [{"family": "inet", "address": "127.0.0.1"}]}
        }),
        (true, None) => json!({"eth0": {"addresses": []}}),
        (false, _) => serde_json::Value::Null,
    };

    let mut devices = serde_json::Map::new();
    devices.insert(
        "root".to_string(),
        json!({"path": "/", "pool": "default", "type": "disk"}),
    );
    for (link, (source, path)) in &c.devices {
        devices.insert(
            link.clone(),
            json!({"source": source, "path": path, "type": "disk"}),
        );
    }

    let snapshots = if c.snapshots.is_empty() {
        serde_json::Value::Null
    } else {
        c.snapshots
            .iter()
            .map(|s| json!({"name": format!("{}/{}", name, s), "created_at": "2019-03-28T12:05:31Z"}))
            .collect()
    };

    let status = if c.running { "Running" } else { "Stopped" };
    json!({
        "name": name,
        "status": status,
        "state": {"network": network},
        "devices": devices,
        "snapshots": snapshots,
    })
}

fn guest(c: &mut FakeContainer, command: &str) -> CommandOutput {
    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["id", flag @ ("-u" | "-g"), user] => match c.users.get(*user) {
            Some((uid, gid)) => ok(format!("{}\n", if *flag == "-u" { uid } else { gid })),
            None => fail(1, format!("id: '{}': no such user", user)),
        },
        ["getent", "passwd", id] => {
            let found = c
                .users
                .iter()
                .find(|(_, (uid, _))| uid.to_string() == *id);
            match found {
                Some((name, (uid, gid))) => {
                    ok(format!("{0}:x:{1}:{2}::/home/{0}:/bin/bash\n", name, uid, gid))
                }
                None => fail(2, ""),
            }
        }
        ["getent", "group", id] => {
            match c.groups.iter().find(|(_, gid)| gid.to_string() == *id) {
                Some((name, gid)) => ok(format!("{}:x:{}:\n", name, gid)),
                None => fail(2, ""),
            }
        }
        ["usermod", "-u", uid, user] => match (uid.parse::<u32>(), c.users.get_mut(*user)) {
            (Ok(uid), Some(ids)) => {
                ids.0 = uid;
                ok("")
            }
            _ => fail(6, format!("usermod: user '{}' does not exist", user)),
        },
        ["groupmod", "-g", gid, group] => match (gid.parse::<u32>(), c.groups.get(*group).copied()) {
            (Ok(new), Some(old)) => {
                c.groups.insert(group.to_string(), new);
                for (_, ids) in c.users.iter_mut() {
                    if ids.1 == old {
                        ids.1 = new;
                    }
                }
                ok("")
            }
            _ => fail(6, format!("groupmod: group '{}' does not exist", group)),
        },
        ["groupadd", "-g", gid, group] => {
            let Ok(gid) = gid.parse::<u32>() else {
                return fail(3, "groupadd: invalid group ID");
            };
            if c.groups.values().any(|g| *g == gid) || c.groups.contains_key(*group) {
                return fail(4, "groupadd: GID is not unique");
            }
            c.groups.insert(group.to_string(), gid);
            ok("")
        }
        ["useradd", "-m", "-s", "/bin/bash", "-U", user] => {
            if c.users.contains_key(*user) {
                return fail(9, format!("useradd: user '{}' already exists", user));
            }
            let (uid, gid) = (c.free_uid(), c.free_gid());
            c.users.insert(user.to_string(), (uid, gid));
            c.groups.insert(user.to_string(), gid);
            ok("")
        }
        ["useradd", "-m", "-s", "/bin/bash", "-g", group, "-u", uid, user] => {
            let Some(gid) = c.groups.get(*group).copied() else {
                return fail(6, format!("useradd: group '{}' does not exist", group));
            };
            let Ok(uid) = uid.parse::<u32>() else {
                return fail(3, "useradd: invalid user ID");
            };
            if c.users.values().any(|(u, _)| *u == uid) {
                return fail(4, "useradd: UID is not unique");
            }
            c.users.insert(user.to_string(), (uid, gid));
            ok("")
        }
        _ => ok(""),
    }
}

impl CommandRunner for FakeHost {
    fn run(&self, command: &str) -> io::Result<CommandOutput> {
        self.state.borrow_mut().calls.push(command.to_string());
        let canned = self.state.borrow().overrides.get(command).cloned();
        Ok(canned.unwrap_or_else(|| self.simulate(command)))
    }

    fn stream(&self, command: &str, sink: &mut dyn Write) -> io::Result<i32> {
        self.state.borrow_mut().calls.push(command.to_string());
        let stripped = command.strip_prefix("sudo ").unwrap_or(command);
        let Some(rest) = stripped.strip_prefix("lxc exec ") else {
            return Ok(127);
        };
        let Some((name, shell)) = rest.split_once(" -- /bin/sh -c ") else {
            return Ok(127);
        };
        let script = unquote(shell);

        let mut state = self.state.borrow_mut();
        let Some(c) = state.containers.get_mut(name) else {
            writeln!(sink, "Error: Instance not found")?;
            return Ok(1);
        };
        if !c.running {
            writeln!(sink, "Error: Instance is not running")?;
            return Ok(1);
        }

        writeln!(sink, "ran: {}", script)?;
        Ok(match script.as_str() {
            "false" => 1,
            "poweroff" => {
                c.running = false;
                255
            }
            _ => 0,
        })
    }

    fn spawn_detached(&self, command: &str) -> io::Result<u32> {
        let mut state = self.state.borrow_mut();
        state.calls.push(command.to_string());
        state.spawned.push(command.to_string());
        let pid = state.next_pid;
        state.next_pid += 1;
        if !state.forwarders_die {
            state.processes.insert(pid, command.to_string());
        }
        Ok(pid)
    }
}
