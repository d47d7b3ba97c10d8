//! Built-in rule table, allow-list and safe intrinsics.
//!
//! Rules are evaluated in table order and the first match wins. Statement
//! rules are checked against every single command and every script
//! statement. Composite rules are checked against whole scripts (with `.`
//! matching newlines) and against single commands.
//!
//! Matching is lexical. Obfuscated or string-concatenated invocations can
//! evade these patterns; the table narrows the attack surface, it does not
//! close it.

use super::{RuleDef, RuleScope};

const fn statement(name: &'static str, pattern: &'static str, rationale: &'static str) -> RuleDef {
    RuleDef::builtin(name, pattern, rationale, RuleScope::Statement)
}

const fn composite(name: &'static str, pattern: &'static str, rationale: &'static str) -> RuleDef {
    RuleDef::builtin(name, pattern, rationale, RuleScope::Composite)
}

/// Rules active under every policy.
pub(crate) const DEFAULT_RULES: &[RuleDef] = &[
    // Destructive file operations
    statement(
        "remove-drive-root",
        r#"\b(Remove-Item|ri|rm|del|erase|rd|rmdir)\b.*\s['"]?([a-z]:[\\/]?|[\\/])['"]?(\s|$)"#,
        "removes a drive or filesystem root",
    ),
    statement(
        "forced-recursive-delete",
        r"\b(Remove-Item|ri|rm|del|erase|rd|rmdir)\b.*(-Recurse\b.*-Force\b|-Force\b.*-Recurse\b)",
        "forced recursive deletion skips every confirmation",
    ),
    statement(
        "cmd-recursive-delete",
        r"\b(del|erase|rd|rmdir)\s+/[sq]\b",
        "cmd.exe silent or recursive deletion",
    ),
    statement(
        "unix-destructive",
        r"\bmkfs(\.\w+)?\b|\bdd\s+if=.+of=/dev/",
        "filesystem creation or raw device writes",
    ),
    statement(
        "fork-bomb",
        r":\(\)\s*\{\s*:\|:&\s*\}\s*;",
        "unbounded process creation",
    ),
    // System disruption
    statement(
        "system-power",
        r"\b(Stop-Computer|Restart-Computer|shutdown(\.exe)?|logoff)\b",
        "powers off or restarts the host",
    ),
    statement(
        "boot-configuration",
        r"\b(bcdedit|bootsect|diskpart)(\.exe)?\b",
        "alters boot configuration or partitions",
    ),
    statement(
        "shadow-copy-deletion",
        r"\bvssadmin(\.exe)?\b.*\bdelete\b|\bwmic\b.*\bshadowcopy\s+delete\b",
        "destroys volume shadow copies",
    ),
    statement(
        "secure-wipe",
        r"\bcipher(\.exe)?\s+/w\b",
        "overwrites free disk space",
    ),
    // Registry and security tooling
    statement(
        "registry-tool",
        r"\breg(\.exe)?\s+(add|delete|import|load|restore)\b",
        "modifies the registry through reg.exe",
    ),
    statement(
        "registry-provider",
        r"\b(Remove-Item|Remove-ItemProperty|Set-ItemProperty|New-ItemProperty|Set-Item)\b.*(\b(HKLM|HKCU|HKCR|HKU):|Registry::)",
        "modifies the registry through the PowerShell provider",
    ),
    statement(
        "defender-tampering",
        r"\b(Set-MpPreference|Add-MpPreference|Remove-MpPreference)\b",
        "changes antimalware configuration",
    ),
    statement(
        "log-tampering",
        r"\b(Clear-EventLog|Remove-EventLog|Clear-History)\b|\bwevtutil(\.exe)?\s+(cl|clear-log)\b",
        "erases event or command history",
    ),
    // Privilege escalation
    statement(
        "elevation",
        r#"\bStart-Process\b.*-Verb\s+['"]?RunAs\b|\brunas(\.exe)?\b"#,
        "requests elevated execution",
    ),
    statement(
        "unix-privilege",
        r"\b(sudo|doas|pkexec)\b",
        "requests elevated execution",
    ),
    // Remote code
    statement(
        "download-execute",
        r"\b(Invoke-WebRequest|iwr|Invoke-RestMethod|irm|curl|wget|Start-BitsTransfer)\b.*\|\s*(&\s*)?(pwsh|powershell|cmd|sh|bash)\b",
        "pipes downloaded content into an interpreter",
    ),
    statement(
        "certutil-abuse",
        r"\bcertutil(\.exe)?\b.*-(urlcache|decode|encode)\b",
        "downloads or decodes payloads with certutil",
    ),
    // Dynamic code evaluation
    composite(
        "dynamic-evaluation",
        r"\b(Invoke-Expression|iex)\b",
        "evaluates arbitrary strings as code",
    ),
    composite(
        "scriptblock-creation",
        r"\[(System\.Management\.Automation\.)?ScriptBlock\]::Create\b|\.InvokeScript\s*\(|\bNewScriptBlock\b",
        "compiles arbitrary strings into script blocks",
    ),
    // Reflection and native code
    composite(
        "assembly-load",
        r"\[(System\.)?Reflection\.Assembly\]::(Load|LoadFile|LoadFrom|LoadWithPartialName|UnsafeLoadFrom)\b",
        "loads assemblies by reflection",
    ),
    composite(
        "assembly-load-invoke",
        r"\b(Load|LoadFile|LoadFrom)\s*\(.*\.(Invoke|InvokeMember|CreateInstance)\s*\(",
        "loads code and later invokes a member of it",
    ),
    composite(
        "inline-type-compilation",
        r"\bAdd-Type\b.*-(TypeDefinition|MemberDefinition)\b",
        "compiles inline C# into the session",
    ),
    composite(
        "native-interop",
        r"\[DllImport\b|\bGetDelegateForFunctionPointer\b|\bVirtualAlloc\b",
        "calls native memory or function-pointer APIs",
    ),
    // Permissions, services, accounts, disks
    composite(
        "acl-change",
        r"\bSet-Acl\b|\btakeown(\.exe)?\b|\bicacls(\.exe)?\b.*/(grant|setowner|reset)\b",
        "forces ownership or permission changes",
    ),
    composite(
        "service-control",
        r"\b(New|Set|Remove|Stop|Suspend)-Service\b|\bsc(\.exe)?\s+(create|config|delete|stop)\b",
        "creates, reconfigures or stops services",
    ),
    composite(
        "account-management",
        r"\b(New|Set|Remove|Enable)-LocalUser\b|\b(Add|Remove)-LocalGroupMember\b|\bnet(\.exe)?\s+(user|localgroup)\b.*\s/(add|delete)\b",
        "creates or modifies local accounts",
    ),
    composite(
        "disk-operations",
        r"\b(Format-Volume|Format-Disk|Clear-Disk|Initialize-Disk|Remove-Partition|Set-Disk)\b|\bformat(\.com)?\s+[a-z]:",
        "formats or repartitions disks",
    ),
    composite(
        "scheduled-persistence",
        r"\bRegister-ScheduledTask\b|\bschtasks(\.exe)?\s+/create\b",
        "installs scheduled tasks",
    ),
    composite(
        "remote-execution",
        r"\bInvoke-Command\b.*-(ComputerName|Session)\b|\b(Enter|New)-PSSession\b",
        "executes code on other hosts",
    ),
    composite(
        "wmi-process-creation",
        r"\b(Invoke-WmiMethod|Invoke-CimMethod)\b.*\bCreate\b",
        "spawns processes through WMI",
    ),
    // Encoded or obfuscated invocation
    composite(
        "encoded-command",
        r"\s-(e|ec|en|enc|enco|encodedcommand)\s+[a-z0-9+/=]{16,}",
        "runs a base64-encoded command",
    ),
    composite(
        "base64-decoding",
        r"\bFromBase64String\s*\(",
        "decodes embedded base64 payloads",
    ),
    composite(
        "char-code-obfuscation",
        r"(\[char\]\s*\d+\s*\+\s*){2,}|\[char\[\]\]\s*\(?\s*\d+\s*,",
        "assembles strings from character codes",
    ),
];

/// Rules active only when execution-policy overrides are not permitted.
pub(crate) const EXECUTION_POLICY_RULES: &[RuleDef] = &[
    composite(
        "execution-policy-change",
        r"\bSet-ExecutionPolicy\b",
        "changes the PowerShell execution policy",
    ),
    composite(
        "execution-policy-bypass",
        r#"\s-(ExecutionPolicy|ep|exec)\s+['"]?(Bypass|Unrestricted)\b"#,
        "starts an interpreter with the execution policy disabled",
    ),
];

/// Base commands permitted by the default policy.
pub(crate) const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    // PowerShell read-mostly cmdlets
    "Get-ChildItem",
    "Get-Content",
    "Get-Item",
    "Get-ItemProperty",
    "Get-Location",
    "Get-Process",
    "Get-Service",
    "Get-Command",
    "Get-Help",
    "Get-Module",
    "Get-FileHash",
    "Get-Member",
    "Select-String",
    "Resolve-Path",
    "Test-Path",
    "Compare-Object",
    // PowerShell workspace edits
    "New-Item",
    "Copy-Item",
    "Move-Item",
    "Rename-Item",
    "Set-Content",
    "Add-Content",
    "Out-File",
    "Set-Location",
    "Push-Location",
    "Pop-Location",
    "Import-Csv",
    "Export-Csv",
    "Invoke-Pester",
    // Toolchains
    "git",
    "go",
    "cargo",
    "rustc",
    "dotnet",
    "npm",
    "npx",
    "node",
    "python",
    "python3",
    "pip",
    "make",
    // Common aliases
    "ls",
    "dir",
    "cat",
    "type",
    "echo",
    "pwd",
    "where",
    "findstr",
    "grep",
];

/// Built-in commands that are always safe to name as a base command.
pub(crate) const SAFE_INTRINSICS: &[&str] = &[
    "Write-Output",
    "Write-Host",
    "Write-Verbose",
    "Write-Warning",
    "Write-Error",
    "Write-Debug",
    "Write-Information",
    "Write-Progress",
    "Out-Null",
    "Out-String",
    "Out-Host",
    "Select-Object",
    "Where-Object",
    "ForEach-Object",
    "Sort-Object",
    "Measure-Object",
    "Group-Object",
    "Format-Table",
    "Format-List",
    "Format-Wide",
    "ConvertTo-Json",
    "ConvertFrom-Json",
    "Get-Date",
    "Start-Sleep",
    "Join-Path",
    "Split-Path",
    "return",
    "exit",
    "break",
    "continue",
    "throw",
];
