//! Remote-management sessions over WS-Management (WinRM).
//!
//! Speaks the windows/shell subset of the protocol: create a shell, start a
//! command, pull base64 output streams until the command reports done, signal
//! terminate, delete the shell. Commands are wrapped in
//! `powershell -EncodedCommand`, and the file primitives ride on that same
//! command channel as base64 payloads.

// Standard library
use std::fs;
use std::path::Path;
use std::time::Duration;

// External crates
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use reqwest::header::CONTENT_TYPE;
use tracing::debug;
use uuid::Uuid;
use vcdrive_core::Credentials;

// Internal imports
use crate::{
    CommandOutput, EntryKind, RemoteDirEntry, RemoteSession, RemoteStat, SessionError,
    SessionResult,
};

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

const OPERATION_TIMEOUT_SECS: u64 = 60;
// Keeps each Add-Content envelope comfortably under MaxEnvelopeSize.
const PUT_CHUNK_BYTES: usize = 48 * 1024;

pub struct WinRmSession {
    client: reqwest::blocking::Client,
    endpoint: String,
    credentials: Credentials,
    host: String,
    shell_id: String,
}

impl WinRmSession {
    /// Opens a session: HTTP client setup plus a shell Create exchange.
    ///
    /// Port 5986 selects HTTPS (self-signed lab certificates accepted);
    /// anything else is plain HTTP.
    pub fn open(
        host: &str,
        port: u16,
        credentials: &Credentials,
        connect_timeout: Duration,
    ) -> SessionResult<Self> {
        let tls = port == 5986;
        let scheme = if tls { "https" } else { "http" };
        let endpoint = format!("{}://{}:{}/wsman", scheme, host, port);

        let mut builder = reqwest::blocking::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(Duration::from_secs(OPERATION_TIMEOUT_SECS + 30));
        if tls {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let client = builder.build().map_err(|e| SessionError::Connect {
            addr: endpoint.clone(),
            reason: e.to_string(),
        })?;

        let mut session = Self {
            client,
            endpoint,
            credentials: credentials.clone(),
            host: host.to_string(),
            shell_id: String::new(),
        };

        let options = r#"<wsman:OptionSet>
      <wsman:Option Name="WINRS_NOPROFILE">TRUE</wsman:Option>
      <wsman:Option Name="WINRS_CODEPAGE">65001</wsman:Option>
    </wsman:OptionSet>"#;
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams><rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let response = session.send(&session.envelope(ACTION_CREATE, None, options, body))?;

        session.shell_id = extract_tag(&response, "ShellId").ok_or_else(|| {
            SessionError::Protocol("shell create response carried no ShellId".to_string())
        })?;
        debug!(
            "WinRM shell {} established on {}",
            session.shell_id, session.host
        );
        Ok(session)
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        option_set: &str,
        body: &str,
    ) -> String {
        let selector_set = match shell_id {
            Some(id) => format!(
                r#"<wsman:SelectorSet><wsman:Selector Name="ShellId">{}</wsman:Selector></wsman:SelectorSet>"#,
                id
            ),
            None => String::new(),
        };
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:wsman="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell">
  <s:Header>
    <wsa:To>{endpoint}</wsa:To>
    <wsman:ResourceURI s:mustUnderstand="true">{resource}</wsman:ResourceURI>
    <wsa:ReplyTo>
      <wsa:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</wsa:Address>
    </wsa:ReplyTo>
    <wsa:Action s:mustUnderstand="true">{action}</wsa:Action>
    <wsa:MessageID>uuid:{message_id}</wsa:MessageID>
    <wsman:MaxEnvelopeSize s:mustUnderstand="true">512000</wsman:MaxEnvelopeSize>
    <wsman:OperationTimeout>PT{timeout}S</wsman:OperationTimeout>
    {selector_set}{option_set}
  </s:Header>
  <s:Body>{body}</s:Body>
</s:Envelope>"#,
            endpoint = self.endpoint,
            resource = RESOURCE_CMD,
            action = action,
            message_id = Uuid::new_v4(),
            timeout = OPERATION_TIMEOUT_SECS,
            selector_set = selector_set,
            option_set = option_set,
            body = body,
        )
    }

    fn send(&self, envelope: &str) -> SessionResult<String> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .body(envelope.to_string())
            .send()
            .map_err(|e| SessionError::Connect {
                addr: self.endpoint.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let text = response.text().map_err(|e| SessionError::Connect {
            addr: self.endpoint.clone(),
            reason: e.to_string(),
        })?;

        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SessionError::Auth {
                username: self.credentials.username.clone(),
                reason: "WinRM endpoint rejected the credentials".to_string(),
            });
        }
        if !status.is_success() {
            return Err(SessionError::Protocol(format!(
                "WinRM request failed with {}: {}",
                status,
                extract_tag(&text, "Text").unwrap_or_else(|| text.clone())
            )));
        }
        Ok(text)
    }

    /// Runs a file-primitive command and maps a non-zero exit to a protocol
    /// error. Errors are promoted to terminating so PowerShell reports them
    /// in the exit code; missing remote paths are recognized from the error
    /// text.
    fn run_ok(&mut self, command: &str, missing_path: Option<&str>) -> SessionResult<CommandOutput> {
        let command = format!("$ErrorActionPreference = 'Stop'; {}", command);
        let output = self.run(&command)?;
        if output.success() {
            return Ok(output);
        }
        let stderr = output.stderr.trim().to_string();
        if let Some(path) = missing_path {
            if stderr.contains("Cannot find path") || stderr.contains("Could not find a part of the path") {
                return Err(SessionError::MissingRemote(path.to_string()));
            }
        }
        Err(SessionError::Protocol(format!(
            "remote command exited {}: {}",
            output.return_code, stderr
        )))
    }
}

impl RemoteSession for WinRmSession {
    fn run(&mut self, command: &str) -> SessionResult<CommandOutput> {
        let options = r#"<wsman:OptionSet>
      <wsman:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</wsman:Option>
    </wsman:OptionSet>"#;
        let body = format!(
            "<rsp:CommandLine><rsp:Command>powershell.exe</rsp:Command>\
             <rsp:Arguments>-NoProfile</rsp:Arguments>\
             <rsp:Arguments>-NonInteractive</rsp:Arguments>\
             <rsp:Arguments>-EncodedCommand</rsp:Arguments>\
             <rsp:Arguments>{}</rsp:Arguments></rsp:CommandLine>",
            encode_powershell(command)
        );
        let response =
            self.send(&self.envelope(ACTION_COMMAND, Some(&self.shell_id), options, &body))?;
        let command_id = extract_tag(&response, "CommandId").ok_or_else(|| {
            SessionError::Protocol("command response carried no CommandId".to_string())
        })?;

        let receive_body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            command_id
        );
        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let mut return_code = -1;
        loop {
            let response = match self.send(&self.envelope(
                ACTION_RECEIVE,
                Some(&self.shell_id),
                "",
                &receive_body,
            )) {
                Ok(response) => response,
                // The endpoint faults when no output arrives within its
                // operation timeout; the command is still running.
                Err(SessionError::Protocol(msg)) if msg.contains("TimedOut") => continue,
                Err(e) => return Err(e),
            };

            for chunk in collect_streams(&response, "stdout") {
                stdout.extend(BASE64.decode(chunk.as_bytes()).unwrap_or_default());
            }
            for chunk in collect_streams(&response, "stderr") {
                stderr.extend(BASE64.decode(chunk.as_bytes()).unwrap_or_default());
            }

            if response.contains("CommandState/Done") {
                if let Some(code) = extract_tag(&response, "ExitCode") {
                    return_code = code.trim().parse().unwrap_or(-1);
                }
                break;
            }
        }

        let signal_body = format!(
            "<rsp:Signal CommandId=\"{}\"><rsp:Code>{}</rsp:Code></rsp:Signal>",
            command_id, SIGNAL_TERMINATE
        );
        let _ = self.send(&self.envelope(ACTION_SIGNAL, Some(&self.shell_id), "", &signal_body));

        debug!(
            "WinRM command on {} exited with {}: {}",
            self.host, return_code, command
        );
        Ok(CommandOutput {
            return_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn put(&mut self, local: &Path, remote: &str) -> SessionResult<()> {
        let data = fs::read(local)?;
        let staging = format!("{}.vcdrive-part", remote);

        self.run_ok(
            &format!(
                "Remove-Item -LiteralPath {} -ErrorAction SilentlyContinue; Set-Content -LiteralPath {} -Value $null",
                ps_quote(&staging),
                ps_quote(&staging),
            ),
            Some(remote),
        )?;
        for chunk in data.chunks(PUT_CHUNK_BYTES) {
            self.run_ok(
                &format!(
                    "Add-Content -LiteralPath {} -Value '{}'",
                    ps_quote(&staging),
                    BASE64.encode(chunk)
                ),
                Some(remote),
            )?;
        }
        // Get-Content -Raw yields $null for an empty staging file; base64 of
        // nothing must still land as an empty file.
        self.run_ok(
            &format!(
                "[Environment]::CurrentDirectory = (Get-Location).Path; \
                 $b64 = Get-Content -LiteralPath {staging} -Raw; \
                 if ($null -eq $b64) {{ $b64 = '' }}; \
                 [IO.File]::WriteAllBytes({remote}, [Convert]::FromBase64String($b64)); \
                 Remove-Item -LiteralPath {staging}",
                remote = ps_quote(remote),
                staging = ps_quote(&staging),
            ),
            Some(remote),
        )?;
        Ok(())
    }

    fn get(&mut self, remote: &str, local: &Path) -> SessionResult<()> {
        let output = self.run_ok(
            &format!(
                "[Environment]::CurrentDirectory = (Get-Location).Path; \
                 [Convert]::ToBase64String([IO.File]::ReadAllBytes({}))",
                ps_quote(remote)
            ),
            Some(remote),
        )?;
        let encoded: String = output
            .stdout
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let bytes = BASE64.decode(encoded.as_bytes()).map_err(|e| {
            SessionError::Protocol(format!("undecodable payload for '{}': {}", remote, e))
        })?;
        fs::write(local, bytes)?;
        Ok(())
    }

    fn stat(&mut self, remote: &str) -> SessionResult<Option<RemoteStat>> {
        let quoted = ps_quote(remote);
        let output = self.run_ok(
            &format!(
                "if (Test-Path -LiteralPath {q}) {{ if ((Get-Item -LiteralPath {q} -Force).PSIsContainer) {{ 'dir' }} else {{ 'file' }} }} else {{ 'none' }}",
                q = quoted
            ),
            None,
        )?;
        match output.stdout.trim() {
            "dir" => Ok(Some(RemoteStat {
                kind: EntryKind::Dir,
            })),
            "file" => Ok(Some(RemoteStat {
                kind: EntryKind::File,
            })),
            "none" => Ok(None),
            other => Err(SessionError::Protocol(format!(
                "unexpected stat reply for '{}': {}",
                remote, other
            ))),
        }
    }

    fn read_dir(&mut self, remote: &str) -> SessionResult<Vec<RemoteDirEntry>> {
        let output = self.run_ok(
            &format!(
                "Get-ChildItem -LiteralPath {} -Force | ForEach-Object {{ if ($_.PSIsContainer) {{ \"d|$($_.Name)\" }} else {{ \"f|$($_.Name)\" }} }}",
                ps_quote(remote)
            ),
            Some(remote),
        )?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| {
                let (kind, name) = line.trim().split_once('|')?;
                Some(RemoteDirEntry {
                    name: name.to_string(),
                    kind: if kind == "d" {
                        EntryKind::Dir
                    } else {
                        EntryKind::File
                    },
                })
            })
            .collect())
    }

    fn make_dirs(&mut self, remote: &str) -> SessionResult<()> {
        self.run_ok(
            &format!(
                "New-Item -ItemType Directory -Force -Path {} | Out-Null",
                ps_quote(remote)
            ),
            None,
        )?;
        Ok(())
    }
}

impl Drop for WinRmSession {
    fn drop(&mut self) {
        if self.shell_id.is_empty() {
            return;
        }
        let envelope = self.envelope(ACTION_DELETE, Some(&self.shell_id), "", "");
        let _ = self.send(&envelope);
    }
}

/// Encodes a command the way `powershell -EncodedCommand` expects:
/// base64 over UTF-16LE.
fn encode_powershell(command: &str) -> String {
    let utf16le: Vec<u8> = command
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64.encode(utf16le)
}

/// Single-quotes a string for PowerShell.
fn ps_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Pulls the text content of the first element with the given local name,
/// tolerating any namespace prefix.
fn extract_tag(xml: &str, name: &str) -> Option<String> {
    let mut search = 0;
    while let Some(pos) = xml[search..].find('<') {
        let start = search + pos + 1;
        let end = start + xml[start..].find('>')?;
        let tag = &xml[start..end];
        search = end + 1;
        if tag.starts_with('/') || tag.starts_with('?') || tag.ends_with('/') {
            continue;
        }
        let tag_name = tag
            .split(|c: char| c.is_whitespace())
            .next()
            .unwrap_or(tag);
        let local = tag_name.rsplit(':').next().unwrap_or(tag_name);
        if local == name {
            let close = end + 1 + xml[end + 1..].find("</")?;
            return Some(xml[end + 1..close].trim().to_string());
        }
    }
    None
}

/// Collects the base64 bodies of every `Stream` element whose `Name`
/// attribute matches; end-of-stream markers are self-closing and skipped.
fn collect_streams(xml: &str, stream_name: &str) -> Vec<String> {
    let name_attr = format!("Name=\"{}\"", stream_name);
    let mut out = Vec::new();
    for opener in ["<rsp:Stream", "<Stream"] {
        let mut search = 0;
        while let Some(pos) = xml[search..].find(opener) {
            let start = search + pos;
            let tag_end = match xml[start..].find('>') {
                Some(p) => start + p,
                None => break,
            };
            let tag = &xml[start..=tag_end];
            search = tag_end + 1;
            if !tag.contains(&name_attr) || tag.ends_with("/>") {
                continue;
            }
            if let Some(close) = xml[tag_end + 1..].find("</") {
                let body = xml[tag_end + 1..tag_end + 1 + close].trim();
                if !body.is_empty() {
                    out.push(body.to_string());
                }
            }
        }
        if !out.is_empty() {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_command_is_utf16le_base64() {
        // "ls" -> 6c 00 73 00
        assert_eq!(encode_powershell("ls"), "bABzAA==");
    }

    #[test]
    fn ps_quote_doubles_single_quotes() {
        assert_eq!(ps_quote("it's"), "'it''s'");
        assert_eq!(ps_quote("plain"), "'plain'");
    }

    #[test]
    fn extract_tag_handles_prefixed_and_bare_names() {
        let xml = "<rsp:Shell><rsp:ShellId>ABC-123</rsp:ShellId></rsp:Shell>";
        assert_eq!(extract_tag(xml, "ShellId").as_deref(), Some("ABC-123"));
        let bare = "<Shell><ShellId> XYZ </ShellId></Shell>";
        assert_eq!(extract_tag(bare, "ShellId").as_deref(), Some("XYZ"));
        assert_eq!(extract_tag(xml, "CommandId"), None);
    }

    #[test]
    fn collect_streams_filters_by_name_and_skips_end_markers() {
        let xml = concat!(
            r#"<rsp:Stream Name="stdout" CommandId="1">aGVsbG8=</rsp:Stream>"#,
            r#"<rsp:Stream Name="stderr" CommandId="1">b29wcw==</rsp:Stream>"#,
            r#"<rsp:Stream Name="stdout" CommandId="1" End="true"/>"#,
        );
        assert_eq!(collect_streams(xml, "stdout"), vec!["aGVsbG8=".to_string()]);
        assert_eq!(collect_streams(xml, "stderr"), vec!["b29wcw==".to_string()]);
    }
}
