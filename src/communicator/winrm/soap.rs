//! WS-Management envelopes for the Windows remote shell and the bits of
//! response parsing the communicator needs.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use lazy_static::lazy_static;
use regex::Regex;
use uuid::Uuid;

use super::WinRmError;

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_ADDRESSING: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const NS_WSMAN: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const NS_WSMAN_MS: &str = "http://schemas.microsoft.com/wbem/wsman/1/wsman.xsd";
const NS_SHELL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SEND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Send";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

const MAX_ENVELOPE_SIZE: u32 = 153600;

/// WSManFault code the service returns when a Receive found no output
/// within the operation timeout.
const WSMAN_TIMED_OUT_CODE: &str = "2150858793";

lazy_static! {
    static ref SHELL_ID: Regex =
        Regex::new(r#"<(?:\w+:)?Selector Name="ShellId">([^<]+)</(?:\w+:)?Selector>"#)
            .expect("shell id pattern");
    static ref SHELL_ID_BODY: Regex =
        Regex::new(r"<(?:\w+:)?ShellId>([^<]+)</(?:\w+:)?ShellId>").expect("shell id pattern");
    static ref COMMAND_ID: Regex =
        Regex::new(r"<(?:\w+:)?CommandId>([^<]+)</(?:\w+:)?CommandId>")
            .expect("command id pattern");
    static ref STREAM: Regex = Regex::new(
        r#"<(?:\w+:)?Stream\s+([^>]*?)(?:/>|>([^<]*)</(?:\w+:)?Stream>)"#
    )
    .expect("stream pattern");
    static ref STREAM_NAME: Regex = Regex::new(r#"Name="(\w+)""#).expect("name pattern");
    static ref COMMAND_DONE: Regex =
        Regex::new(r#"<(?:\w+:)?CommandState[^>]*State="[^"]*/Done""#).expect("state pattern");
    static ref EXIT_CODE: Regex =
        Regex::new(r"<(?:\w+:)?ExitCode>(-?\d+)</(?:\w+:)?ExitCode>").expect("exit code pattern");
    static ref FAULT_SUBCODE: Regex = Regex::new(
        r"<(?:\w+:)?Subcode>\s*<(?:\w+:)?Value>([^<]+)</(?:\w+:)?Value>"
    )
    .expect("subcode pattern");
    static ref FAULT_REASON: Regex =
        Regex::new(r"<(?:\w+:)?Text[^>]*>([^<]*)</(?:\w+:)?Text>").expect("reason pattern");
    static ref WSMAN_FAULT_CODE: Regex =
        Regex::new(r#"<(?:\w+:)?WSManFault[^>]*Code="(\d+)""#).expect("wsman fault pattern");
}

/// Formats an operation timeout as an xs:duration, e.g. `PT60S`.
pub fn format_duration(timeout: Duration) -> String {
    let millis = timeout.subsec_millis();
    if millis == 0 {
        format!("PT{}S", timeout.as_secs())
    } else {
        format!("PT{}.{:03}S", timeout.as_secs(), millis)
    }
}

pub fn escape_xml(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

/// Wraps a PowerShell script so cmd.exe can run it without quoting trouble.
pub fn powershell(script: &str) -> String {
    let utf16: Vec<u8> = script.encode_utf16().flat_map(u16::to_le_bytes).collect();
    format!("powershell.exe -EncodedCommand {}", STANDARD.encode(utf16))
}

/// Header fields shared by every request to one endpoint.
#[derive(Debug, Clone)]
pub struct Envelope {
    endpoint: String,
    operation_timeout: String,
}

struct Request<'a> {
    action: &'a str,
    shell_id: Option<&'a str>,
    options: &'a [(&'a str, &'a str)],
    body: String,
}

impl Envelope {
    pub fn new(endpoint: impl Into<String>, operation_timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            operation_timeout: format_duration(operation_timeout),
        }
    }

    fn render(&self, request: Request<'_>) -> String {
        let mut header = String::new();
        header.push_str(&format!("<a:To>{}</a:To>", escape_xml(&self.endpoint)));
        header.push_str(&format!(
            r#"<a:ReplyTo><a:Address mustUnderstand="true">{ANONYMOUS}</a:Address></a:ReplyTo>"#
        ));
        header.push_str(&format!(
            r#"<w:MaxEnvelopeSize mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>"#
        ));
        header.push_str(&format!("<a:MessageID>uuid:{}</a:MessageID>", Uuid::new_v4()));
        header.push_str(r#"<w:Locale mustUnderstand="false" xml:lang="en-US"/>"#);
        header.push_str(r#"<p:DataLocale mustUnderstand="false" xml:lang="en-US"/>"#);
        header.push_str(&format!(
            "<w:OperationTimeout>{}</w:OperationTimeout>",
            self.operation_timeout
        ));
        header.push_str(&format!(
            r#"<w:ResourceURI mustUnderstand="true">{RESOURCE_CMD}</w:ResourceURI>"#
        ));
        header.push_str(&format!(
            r#"<a:Action mustUnderstand="true">{}</a:Action>"#,
            request.action
        ));
        if let Some(shell_id) = request.shell_id {
            header.push_str(&format!(
                r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                escape_xml(shell_id)
            ));
        }
        if !request.options.is_empty() {
            header.push_str("<w:OptionSet>");
            for (name, value) in request.options {
                header.push_str(&format!(r#"<w:Option Name="{name}">{value}</w:Option>"#));
            }
            header.push_str("</w:OptionSet>");
        }

        format!(
            concat!(
                r#"<?xml version="1.0" encoding="UTF-8"?>"#,
                r#"<env:Envelope xmlns:env="{}" xmlns:a="{}" xmlns:w="{}" xmlns:p="{}" xmlns:rsp="{}">"#,
                "<env:Header>{}</env:Header><env:Body>{}</env:Body></env:Envelope>"
            ),
            NS_SOAP, NS_ADDRESSING, NS_WSMAN, NS_WSMAN_MS, NS_SHELL, header, request.body
        )
    }

    pub fn create_shell(&self) -> String {
        self.render(Request {
            action: ACTION_CREATE,
            shell_id: None,
            options: &[("WINRS_NOPROFILE", "FALSE"), ("WINRS_CODEPAGE", "65001")],
            body: "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
                   <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>"
                .to_string(),
        })
    }

    pub fn delete_shell(&self, shell_id: &str) -> String {
        self.render(Request {
            action: ACTION_DELETE,
            shell_id: Some(shell_id),
            options: &[],
            body: String::new(),
        })
    }

    pub fn execute(&self, shell_id: &str, command: &str) -> String {
        self.render(Request {
            action: ACTION_COMMAND,
            shell_id: Some(shell_id),
            options: &[
                ("WINRS_CONSOLEMODE_STDIN", "TRUE"),
                ("WINRS_SKIP_CMD_SHELL", "FALSE"),
            ],
            body: format!(
                "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
                escape_xml(command)
            ),
        })
    }

    pub fn send(&self, shell_id: &str, command_id: &str, input: &[u8], end: bool) -> String {
        let end = if end { r#" End="true""# } else { "" };
        self.render(Request {
            action: ACTION_SEND,
            shell_id: Some(shell_id),
            options: &[],
            body: format!(
                r#"<rsp:Send><rsp:Stream Name="stdin" CommandId="{}"{}>{}</rsp:Stream></rsp:Send>"#,
                escape_xml(command_id),
                end,
                STANDARD.encode(input)
            ),
        })
    }

    pub fn receive(&self, shell_id: &str, command_id: &str) -> String {
        self.render(Request {
            action: ACTION_RECEIVE,
            shell_id: Some(shell_id),
            options: &[],
            body: format!(
                r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
                escape_xml(command_id)
            ),
        })
    }

    pub fn terminate(&self, shell_id: &str, command_id: &str) -> String {
        self.render(Request {
            action: ACTION_SIGNAL,
            shell_id: Some(shell_id),
            options: &[],
            body: format!(
                r#"<rsp:Signal CommandId="{}"><rsp:Code>{SIGNAL_TERMINATE}</rsp:Code></rsp:Signal>"#,
                escape_xml(command_id)
            ),
        })
    }
}

pub fn parse_shell_id(response: &str) -> Result<String, WinRmError> {
    SHELL_ID
        .captures(response)
        .or_else(|| SHELL_ID_BODY.captures(response))
        .map(|c| c[1].trim().to_string())
        .ok_or_else(|| WinRmError::MalformedResponse("no ShellId in create response".into()))
}

pub fn parse_command_id(response: &str) -> Result<String, WinRmError> {
    COMMAND_ID
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .ok_or_else(|| WinRmError::MalformedResponse("no CommandId in command response".into()))
}

/// Decoded output of one Receive round trip.
#[derive(Debug, Default, PartialEq)]
pub struct ReceiveOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Set once the command has finished.
    pub exit_code: Option<i32>,
}

pub fn parse_receive(response: &str) -> Result<ReceiveOutput, WinRmError> {
    let mut output = ReceiveOutput::default();
    for stream in STREAM.captures_iter(response) {
        let Some(content) = stream.get(2).map(|m| m.as_str().trim()) else {
            continue;
        };
        if content.is_empty() {
            continue;
        }
        let decoded = STANDARD.decode(content)?;
        match STREAM_NAME.captures(&stream[1]).map(|c| c[1].to_string()) {
            Some(name) if name == "stdout" => output.stdout.extend_from_slice(&decoded),
            Some(name) if name == "stderr" => output.stderr.extend_from_slice(&decoded),
            _ => {}
        }
    }

    if COMMAND_DONE.is_match(response) {
        let code = EXIT_CODE
            .captures(response)
            .and_then(|c| c[1].parse().ok())
            .unwrap_or(0);
        output.exit_code = Some(code);
    }
    Ok(output)
}

/// A SOAP fault returned by the service.
#[derive(Debug, Clone, PartialEq)]
pub struct Fault {
    pub code: String,
    pub reason: String,
    pub wsman_code: Option<String>,
}

impl Fault {
    /// Receive polls that found nothing new within the operation timeout.
    pub fn is_timed_out(&self) -> bool {
        self.code.ends_with("TimedOut") || self.wsman_code.as_deref() == Some(WSMAN_TIMED_OUT_CODE)
    }
}

pub fn parse_fault(response: &str) -> Option<Fault> {
    if !response.contains("Fault") {
        return None;
    }
    let code = FAULT_SUBCODE
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let reason = FAULT_REASON
        .captures(response)
        .map(|c| c[1].trim().to_string())
        .unwrap_or_default();
    let wsman_code = WSMAN_FAULT_CODE.captures(response).map(|c| c[1].to_string());
    Some(Fault {
        code,
        reason,
        wsman_code,
    })
}
