// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Line-oriented configuration syntax
//!
//! Sections `global` / `defaults` / `frontend` / `backend` / `listen` with
//! whitespace-separated keywords, `#` comments, haproxy-flavored duration
//! (`us`/`ms`/`s`/`m`/`h`/`d`) and size (`k`/`m`/`g`) suffixes. A `listen`
//! section is a frontend and a backend sharing one name.

use std::net::SocketAddr;

use tracing::warn;

use crate::config::{
    Algorithm, BindConfig, CheckConfig, CheckKind, Config, ConfigError, FrontendConfig, Mode,
    PoolConfig, ServerConfig, StickKeyType, StickOn, StickTableConfig,
};

#[derive(Debug, Clone, Copy)]
enum Section {
    None,
    Global,
    Defaults,
    Frontend(usize),
    Backend(usize),
    /// Frontend and pool created together; keywords land on whichever side
    /// understands them.
    Listen(usize, usize),
}

/// Parses the line-oriented syntax into a [`Config`]. Validation is the
/// caller's job.
pub fn parse(text: &str) -> Result<Config, ConfigError> {
    let mut cfg = Config::default();
    let mut section = Section::None;

    for (idx, raw) in text.lines().enumerate() {
        let line = idx + 1;
        let content = match raw.find('#') {
            Some(at) => &raw[..at],
            None => raw,
        };
        let args: Vec<&str> = content.split_whitespace().collect();
        if args.is_empty() {
            continue;
        }

        let err = |msg: String| ConfigError::Syntax { line, msg };

        match args[0] {
            "global" => section = Section::Global,
            "defaults" => section = Section::Defaults,
            "frontend" => {
                let name = *args.get(1).ok_or_else(|| err("frontend needs a name".into()))?;
                cfg.frontends.push(new_frontend(name));
                section = Section::Frontend(cfg.frontends.len() - 1);
            }
            "backend" => {
                let name = *args.get(1).ok_or_else(|| err("backend needs a name".into()))?;
                cfg.backends.push(new_pool(name));
                section = Section::Backend(cfg.backends.len() - 1);
            }
            "listen" => {
                let name = *args.get(1).ok_or_else(|| err("listen needs a name".into()))?;
                let mut fe = new_frontend(name);
                fe.default_backend = name.to_string();
                cfg.frontends.push(fe);
                cfg.backends.push(new_pool(name));
                section = Section::Listen(cfg.frontends.len() - 1, cfg.backends.len() - 1);
            }
            _ => match section {
                Section::None => {
                    return Err(err(format!("'{}' before any section", args[0])));
                }
                Section::Global => parse_global(&mut cfg, &args, line)?,
                Section::Defaults => parse_defaults(&mut cfg, &args, line)?,
                Section::Frontend(fe) => parse_frontend(&mut cfg, fe, &args, line)?,
                Section::Backend(pool) => parse_backend(&mut cfg, pool, &args, line)?,
                Section::Listen(fe, pool) => {
                    if frontend_keyword(args[0]) {
                        parse_frontend(&mut cfg, fe, &args, line)?
                    } else {
                        parse_backend(&mut cfg, pool, &args, line)?
                    }
                }
            },
        }
    }

    Ok(cfg)
}

fn new_frontend(name: &str) -> FrontendConfig {
    FrontendConfig {
        name: name.to_string(),
        binds: Vec::new(),
        mode: None,
        default_backend: String::new(),
        maxconn: 0,
    }
}

fn new_pool(name: &str) -> PoolConfig {
    PoolConfig {
        name: name.to_string(),
        balance: Algorithm::RoundRobin,
        servers: Vec::new(),
        retries: None,
        redispatch: None,
        check: None,
        stick_table: None,
        stick_on: None,
        connect_timeout_ms: None,
    }
}

fn frontend_keyword(kw: &str) -> bool {
    matches!(kw, "bind" | "default_backend" | "use_backend" | "maxconn" | "mode")
}

fn parse_global(cfg: &mut Config, args: &[&str], line: usize) -> Result<(), ConfigError> {
    let err = |msg: String| ConfigError::Syntax { line, msg };
    match args[0] {
        "maxconn" => cfg.global.maxconn = int_arg(args, 1, line)?,
        "nbthread" => cfg.global.nbthread = int_arg(args, 1, line)?,
        "stats" if args.get(1) == Some(&"socket") => {
            let path = args.get(2).ok_or_else(|| err("stats socket needs a path".into()))?;
            cfg.global.stats_socket = Some(path.into());
        }
        "pidfile" => {
            let path = args.get(1).ok_or_else(|| err("pidfile needs a path".into()))?;
            cfg.global.pidfile = Some(path.into());
        }
        "tune.bufsize" => cfg.global.tune.bufsize = int_arg(args, 1, line)?,
        "tune.maxspill" => {
            let raw = args.get(1).ok_or_else(|| err("tune.maxspill needs a value".into()))?;
            cfg.global.tune.maxspill = parse_size(raw).ok_or_else(|| err(format!("bad size '{raw}'")))? as usize;
        }
        "daemon" | "log" => {} // process supervision and log routing live outside the core
        other => warn!(line, keyword = other, "unknown global directive ignored"),
    }
    Ok(())
}

fn parse_defaults(cfg: &mut Config, args: &[&str], line: usize) -> Result<(), ConfigError> {
    match args[0] {
        "mode" => cfg.defaults.mode = mode_arg(args, line)?,
        "timeout" => {
            let ms = duration_arg(args, 2, line)?;
            match *args.get(1).unwrap_or(&"") {
                "connect" => cfg.defaults.timeout_connect_ms = ms,
                "client" => cfg.defaults.timeout_client_ms = ms,
                "server" => cfg.defaults.timeout_server_ms = ms,
                "check" => cfg.defaults.timeout_check_ms = ms,
                other => {
                    return Err(ConfigError::Syntax {
                        line,
                        msg: format!("unknown timeout '{other}'"),
                    })
                }
            }
        }
        "retries" => cfg.defaults.retries = int_arg(args, 1, line)?,
        "maxconn" => cfg.defaults.maxconn = int_arg(args, 1, line)?,
        "option" => match *args.get(1).unwrap_or(&"") {
            "redispatch" => cfg.defaults.redispatch = true,
            "tcplog" | "httplog" | "dontlognull" => {}
            other => warn!(line, option = other, "unknown defaults option ignored"),
        },
        other => warn!(line, keyword = other, "unknown defaults directive ignored"),
    }
    Ok(())
}

fn parse_frontend(cfg: &mut Config, fe: usize, args: &[&str], line: usize) -> Result<(), ConfigError> {
    let err = |msg: String| ConfigError::Syntax { line, msg };
    let fe = &mut cfg.frontends[fe];
    match args[0] {
        "bind" => {
            let raw = args.get(1).ok_or_else(|| err("bind needs ADDR:PORT".into()))?;
            let addr: SocketAddr = raw
                .parse()
                .map_err(|_| err(format!("bad bind address '{raw}'")))?;
            let mut bind = BindConfig {
                addr,
                backlog: 1024,
                defer_accept: true,
                ssl: false,
            };
            let mut i = 2;
            while i < args.len() {
                match args[i] {
                    "backlog" => {
                        bind.backlog = int_arg(args, i + 1, line)?;
                        i += 2;
                    }
                    "defer-accept" => {
                        bind.defer_accept = true;
                        i += 1;
                    }
                    "ssl" => {
                        bind.ssl = true;
                        i += 1;
                    }
                    "crt" | "alpn" => i += 2, // TLS material for the external terminator
                    other => return Err(err(format!("unknown bind option '{other}'"))),
                }
            }
            fe.binds.push(bind);
        }
        "default_backend" => {
            fe.default_backend = args
                .get(1)
                .ok_or_else(|| err("default_backend needs a name".into()))?
                .to_string();
        }
        "use_backend" => {
            return Err(err(
                "use_backend rules require the ACL collaborator, which is not linked in".into(),
            ));
        }
        "mode" => fe.mode = Some(mode_arg(args, line)?),
        "maxconn" => fe.maxconn = int_arg(args, 1, line)?,
        "option" => {}
        other => warn!(line, keyword = other, "unknown frontend directive ignored"),
    }
    Ok(())
}

fn parse_backend(cfg: &mut Config, pool: usize, args: &[&str], line: usize) -> Result<(), ConfigError> {
    let err = |msg: String| ConfigError::Syntax { line, msg };
    let pool = &mut cfg.backends[pool];
    match args[0] {
        "balance" => {
            pool.balance = match *args.get(1).unwrap_or(&"") {
                "roundrobin" => Algorithm::RoundRobin,
                "static-rr" => Algorithm::StaticRr,
                "leastconn" => Algorithm::LeastConn,
                "weighted" => Algorithm::WeightedRandom,
                "source" => Algorithm::Source,
                "uri" => Algorithm::Uri,
                "url_param" => Algorithm::UrlParam(
                    args.get(2)
                        .ok_or_else(|| err("balance url_param needs a parameter name".into()))?
                        .to_string(),
                ),
                "hdr" => Algorithm::Header(
                    args.get(2)
                        .ok_or_else(|| err("balance hdr needs a header name".into()))?
                        .to_string(),
                ),
                "random" => Algorithm::ResponseTime,
                other => return Err(err(format!("unknown balance algorithm '{other}'"))),
            };
        }
        "server" => {
            let name = args.get(1).ok_or_else(|| err("server needs a name".into()))?;
            let addr = args.get(2).ok_or_else(|| err("server needs HOST:PORT".into()))?;
            let (host, port) = addr
                .rsplit_once(':')
                .ok_or_else(|| err(format!("bad server address '{addr}'")))?;
            let port: u16 = port.parse().map_err(|_| err(format!("bad port in '{addr}'")))?;

            let mut srv = ServerConfig {
                name: name.to_string(),
                host: host.to_string(),
                port,
                weight: 1,
                maxconn: 0,
                backup: false,
                check: false,
                check_port: None,
                inter_ms: None,
                fastinter_ms: None,
                downinter_ms: None,
                rise: None,
                fall: None,
            };

            let mut i = 3;
            while i < args.len() {
                match args[i] {
                    "weight" => {
                        srv.weight = int_arg(args, i + 1, line)?;
                        i += 2;
                    }
                    "maxconn" => {
                        srv.maxconn = int_arg(args, i + 1, line)?;
                        i += 2;
                    }
                    "backup" => {
                        srv.backup = true;
                        i += 1;
                    }
                    "check" => {
                        srv.check = true;
                        i += 1;
                    }
                    "port" => {
                        srv.check_port = Some(int_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    "inter" => {
                        srv.inter_ms = Some(duration_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    "fastinter" => {
                        srv.fastinter_ms = Some(duration_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    "downinter" => {
                        srv.downinter_ms = Some(duration_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    "rise" => {
                        srv.rise = Some(int_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    "fall" => {
                        srv.fall = Some(int_arg(args, i + 1, line)?);
                        i += 2;
                    }
                    other => return Err(err(format!("unknown server option '{other}'"))),
                }
            }
            pool.servers.push(srv);
        }
        "retries" => pool.retries = Some(int_arg(args, 1, line)?),
        "timeout" => match *args.get(1).unwrap_or(&"") {
            "connect" => pool.connect_timeout_ms = Some(duration_arg(args, 2, line)?),
            "check" => check_mut(pool).timeout_ms = duration_arg(args, 2, line)?,
            // client/server timeouts are process-wide; accept them in listen
            // sections without effect.
            "client" | "server" => {
                warn!(line, "per-backend client/server timeouts are taken from defaults");
            }
            other => return Err(err(format!("unknown backend timeout '{other}'"))),
        },
        "option" => match *args.get(1).unwrap_or(&"") {
            "redispatch" => pool.redispatch = Some(true),
            "httpchk" => {
                let check = check_mut(pool);
                check.kind = CheckKind::Http;
                if let Some(method) = args.get(2) {
                    check.http_method = method.to_string();
                }
                if let Some(uri) = args.get(3) {
                    check.http_uri = uri.to_string();
                }
            }
            "tcp-check" => check_mut(pool).kind = CheckKind::Tcp,
            "mysql-check" => check_mut(pool).kind = CheckKind::Mysql,
            "pgsql-check" => check_mut(pool).kind = CheckKind::Pgsql,
            "redis-check" => check_mut(pool).kind = CheckKind::Redis,
            "smtp-check" => check_mut(pool).kind = CheckKind::Smtp,
            "ldap-check" => check_mut(pool).kind = CheckKind::Ldap,
            "agent-check" => check_mut(pool).kind = CheckKind::Agent,
            "external-check" => check_mut(pool).kind = CheckKind::External,
            "tcplog" | "httplog" | "dontlognull" => {}
            other => warn!(line, option = other, "unknown backend option ignored"),
        },
        "external-check" if args.get(1) == Some(&"command") => {
            let check = check_mut(pool);
            check.kind = CheckKind::External;
            check.external_command = Some(args[2..].join(" "));
        }
        "http-check" if args.get(1) == Some(&"expect") && args.get(2) == Some(&"status") => {
            check_mut(pool).expect_status = Some(int_arg(args, 3, line)?);
        }
        "tcp-check" => match *args.get(1).unwrap_or(&"") {
            "send" => check_mut(pool).send = Some(args[2..].join(" ")),
            "expect" => {
                let check = check_mut(pool);
                if args.get(2) == Some(&"rstring") {
                    check.expect_regex = Some(args[3..].join(" "));
                } else {
                    check.expect = Some(args[2..].join(" "));
                }
            }
            other => return Err(err(format!("unknown tcp-check rule '{other}'"))),
        },
        "max-lag" => check_mut(pool).max_lag_ms = Some(duration_arg(args, 1, line)?),
        "stick-table" => {
            pool.stick_table = Some(parse_stick_table(&args[1..], line)?);
        }
        "stick" => {
            if args.get(1) == Some(&"on") && args.get(2) == Some(&"src") {
                pool.stick_on = Some(StickOn::Src);
            } else {
                return Err(err("only 'stick on src' is supported".into()));
            }
        }
        "mode" => {} // pool side of a listen section; mode is a frontend property
        other => warn!(line, keyword = other, "unknown backend directive ignored"),
    }
    Ok(())
}

fn check_mut(pool: &mut PoolConfig) -> &mut CheckConfig {
    pool.check.get_or_insert_with(CheckConfig::default)
}

/// Parses `type T size N expire D` in any order after `stick-table`.
fn parse_stick_table(args: &[&str], line: usize) -> Result<StickTableConfig, ConfigError> {
    let err = |msg: String| ConfigError::Syntax { line, msg };

    let mut key_type = None;
    let mut size = None;
    let mut expire = None;

    let mut i = 0;
    while i < args.len() {
        match args[i] {
            "type" => {
                key_type = Some(match *args.get(i + 1).unwrap_or(&"") {
                    "ip" => StickKeyType::Ip,
                    "ipv6" => StickKeyType::Ipv6,
                    "integer" => StickKeyType::Integer,
                    "string" => StickKeyType::String,
                    "binary" => StickKeyType::Binary,
                    other => return Err(err(format!("unknown stick-table type '{other}'"))),
                });
                i += 2;
            }
            "size" => {
                let raw = args.get(i + 1).ok_or_else(|| err("size needs a value".into()))?;
                size = Some(parse_size(raw).ok_or_else(|| err(format!("bad size '{raw}'")))?);
                i += 2;
            }
            "expire" => {
                let raw = args.get(i + 1).ok_or_else(|| err("expire needs a value".into()))?;
                expire =
                    Some(parse_duration_ms(raw).ok_or_else(|| err(format!("bad duration '{raw}'")))?);
                i += 2;
            }
            other => return Err(err(format!("unknown stick-table option '{other}'"))),
        }
    }

    Ok(StickTableConfig {
        key_type: key_type.ok_or_else(|| err("stick-table needs a type".into()))?,
        size: size.ok_or_else(|| err("stick-table needs a size".into()))?,
        expire_ms: expire.unwrap_or(30 * 60 * 1000),
    })
}

/// Parses a duration with an optional `us`/`ms`/`s`/`m`/`h`/`d` suffix;
/// the bare-number unit is milliseconds.
pub fn parse_duration_ms(raw: &str) -> Option<u64> {
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match suffix {
        "" | "ms" => Some(value),
        "us" => Some(value / 1000),
        "s" => value.checked_mul(1000),
        "m" => value.checked_mul(60 * 1000),
        "h" => value.checked_mul(60 * 60 * 1000),
        "d" => value.checked_mul(24 * 60 * 60 * 1000),
        _ => None,
    }
}

/// Parses a count with an optional binary `k`/`m`/`g` suffix.
pub fn parse_size(raw: &str) -> Option<u64> {
    let split = raw.find(|c: char| !c.is_ascii_digit()).unwrap_or(raw.len());
    let (digits, suffix) = raw.split_at(split);
    let value: u64 = digits.parse().ok()?;

    match suffix {
        "" => Some(value),
        "k" | "K" => value.checked_mul(1 << 10),
        "m" | "M" => value.checked_mul(1 << 20),
        "g" | "G" => value.checked_mul(1 << 30),
        _ => None,
    }
}

fn int_arg<T: std::str::FromStr>(args: &[&str], at: usize, line: usize) -> Result<T, ConfigError> {
    let raw = args.get(at).ok_or_else(|| ConfigError::Syntax {
        line,
        msg: format!("'{}' needs a numeric argument", args[0]),
    })?;
    raw.parse().map_err(|_| ConfigError::Syntax {
        line,
        msg: format!("bad number '{raw}'"),
    })
}

fn duration_arg(args: &[&str], at: usize, line: usize) -> Result<u64, ConfigError> {
    let raw = args.get(at).ok_or_else(|| ConfigError::Syntax {
        line,
        msg: format!("'{}' needs a duration", args[0]),
    })?;
    parse_duration_ms(raw).ok_or_else(|| ConfigError::Syntax {
        line,
        msg: format!("bad duration '{raw}'"),
    })
}

fn mode_arg(args: &[&str], line: usize) -> Result<Mode, ConfigError> {
    match *args.get(1).unwrap_or(&"") {
        "tcp" => Ok(Mode::Tcp),
        "http" => Ok(Mode::Http),
        other => Err(ConfigError::Syntax {
            line,
            msg: format!("unknown mode '{other}'"),
        }),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{Algorithm, CheckKind, Mode, StickKeyType};

    const SAMPLE: &str = r#"
global
    maxconn 50000
    nbthread 4
    stats socket /run/ub.sock
    tune.bufsize 32768

defaults
    mode http
    timeout connect 5s
    timeout client 30s
    timeout server 30s
    retries 2
    option redispatch

frontend web
    bind 0.0.0.0:8080 backlog 2048
    maxconn 10000
    default_backend app

backend app
    balance leastconn
    option httpchk GET /healthz
    http-check expect status 200
    server app1 10.0.0.1:9000 weight 4 check inter 2s rise 2 fall 3
    server app2 10.0.0.2:9000 weight 2 check backup
    stick-table type ip size 10k expire 30m
    stick on src
"#;

    #[test]
    fn sample_parses_and_validates() {
        let cfg = parse(SAMPLE).unwrap();
        cfg.validate().unwrap();

        assert_eq!(50_000, cfg.global.maxconn);
        assert_eq!(4, cfg.global.nbthread);
        assert_eq!(32_768, cfg.global.tune.bufsize);
        assert_eq!(Mode::Http, cfg.defaults.mode);
        assert_eq!(5_000, cfg.defaults.timeout_connect_ms);
        assert_eq!(2, cfg.defaults.retries);
        assert!(cfg.defaults.redispatch);

        let fe = &cfg.frontends[0];
        assert_eq!("web", fe.name);
        assert_eq!(2048, fe.binds[0].backlog);
        assert_eq!(10_000, fe.maxconn);
        assert_eq!("app", fe.default_backend);

        let pool = &cfg.backends[0];
        assert_eq!(Algorithm::LeastConn, pool.balance);
        let check = pool.check.as_ref().unwrap();
        assert_eq!(CheckKind::Http, check.kind);
        assert_eq!("GET", check.http_method);
        assert_eq!("/healthz", check.http_uri);
        assert_eq!(Some(200), check.expect_status);

        assert_eq!(2, pool.servers.len());
        assert_eq!(4, pool.servers[0].weight);
        assert_eq!(Some(2_000), pool.servers[0].inter_ms);
        assert_eq!(Some(2), pool.servers[0].rise);
        assert!(pool.servers[1].backup);

        let st = pool.stick_table.as_ref().unwrap();
        assert_eq!(StickKeyType::Ip, st.key_type);
        assert_eq!(10 * 1024, st.size);
        assert_eq!(30 * 60 * 1000, st.expire_ms);
        assert!(pool.stick_on.is_some());
    }

    #[test]
    fn listen_section_creates_both_sides() {
        let cfg = parse(
            "listen db\n    bind 127.0.0.1:5433\n    balance source\n    server pg1 127.0.0.1:5432 check\n    option pgsql-check\n",
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!("db", cfg.frontends[0].name);
        assert_eq!("db", cfg.frontends[0].default_backend);
        assert_eq!(Algorithm::Source, cfg.backends[0].balance);
        assert_eq!(CheckKind::Pgsql, cfg.backends[0].check.as_ref().unwrap().kind);
    }

    #[test]
    fn durations_and_sizes_take_suffixes() {
        assert_eq!(Some(1500), parse_duration_ms("1500"));
        assert_eq!(Some(2000), parse_duration_ms("2s"));
        assert_eq!(Some(90_000), parse_duration_ms("90s"));
        assert_eq!(Some(1_800_000), parse_duration_ms("30m"));
        assert_eq!(Some(3_600_000), parse_duration_ms("1h"));
        assert_eq!(None, parse_duration_ms("1w"));

        assert_eq!(Some(500), parse_size("500"));
        assert_eq!(Some(200 * 1024), parse_size("200k"));
        assert_eq!(Some(2 << 20), parse_size("2m"));
        assert_eq!(None, parse_size("2x"));
    }

    #[test]
    fn use_backend_is_rejected() {
        let res = parse("frontend f\n    bind 0.0.0.0:1\n    use_backend x if acl1\n");
        assert!(res.is_err());
        let msg = res.unwrap_err().to_string();
        assert!(msg.contains("ACL collaborator"), "{msg}");
    }

    #[test]
    fn keywords_outside_sections_fail() {
        assert!(parse("maxconn 100\n").is_err());
    }

    #[test]
    fn bad_bind_address_is_reported_with_line() {
        let msg = parse("frontend f\n    bind not-an-addr\n").unwrap_err().to_string();
        assert!(msg.contains("line 2"), "{msg}");
    }
}
