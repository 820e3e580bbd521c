// Permission Grammar - manifest permission strings
//
// Maps raw permission strings from a manifest onto a closed set of known
// capabilities. Parsing is total: anything not in the table comes back as
// `Permission::Unknown` with the original string untouched, so manifests that
// declare newer permissions still load.

use std::collections::{HashMap, HashSet};
use std::fmt;

macro_rules! known_permissions {
    ($($variant:ident => $name:literal,)+) => {
        /// A permission this shim recognizes
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum KnownPermission {
            $($variant,)+
        }

        impl KnownPermission {
            /// Every known permission, in table order
            pub const ALL: &'static [KnownPermission] = &[$(KnownPermission::$variant,)+];

            /// Canonical manifest spelling
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(KnownPermission::$variant => $name,)+
                }
            }
        }
    };
}

known_permissions! {
    AccessibilityFeaturesModify => "accessibilityFeatures.modify",
    AccessibilityFeaturesRead => "accessibilityFeatures.read",
    ActiveTab => "activeTab",
    Alarms => "alarms",
    Audio => "audio",
    Background => "background",
    Bookmarks => "bookmarks",
    BrowsingData => "browsingData",
    CertificateProvider => "certificateProvider",
    ClipboardRead => "clipboardRead",
    ClipboardWrite => "clipboardWrite",
    ContentSettings => "contentSettings",
    ContextMenus => "contextMenus",
    Cookies => "cookies",
    Debugger => "debugger",
    DeclarativeContent => "declarativeContent",
    DeclarativeNetRequest => "declarativeNetRequest",
    DeclarativeNetRequestFeedback => "declarativeNetRequestFeedback",
    DeclarativeNetRequestWithHostAccess => "declarativeNetRequestWithHostAccess",
    DesktopCapture => "desktopCapture",
    Dns => "dns",
    DocumentScan => "documentScan",
    Downloads => "downloads",
    DownloadsBeta => "downloads.beta",
    DownloadsOpen => "downloads.open",
    DownloadsUi => "downloads.ui",
    EnterpriseDeviceAttributes => "enterprise.deviceAttributes",
    EnterpriseHardwarePlatform => "enterprise.hardwarePlatform",
    EnterpriseNetworkingAttributes => "enterprise.networkingAttributes",
    EnterprisePlatformKeys => "enterprise.platformKeys",
    Favicon => "favicon",
    FileBrowserHandler => "fileBrowserHandler",
    FileSystemProvider => "fileSystemProvider",
    FontSettings => "fontSettings",
    Gcm => "gcm",
    Geolocation => "geolocation",
    History => "history",
    Identity => "identity",
    IdentityEmail => "identity.email",
    Idle => "idle",
    LoginState => "loginState",
    Management => "management",
    NativeMessaging => "nativeMessaging",
    Notifications => "notifications",
    Offscreen => "offscreen",
    PageCapture => "pageCapture",
    PlatformKeys => "platformKeys",
    Power => "power",
    PrinterProvider => "printerProvider",
    Printing => "printing",
    PrintingMetrics => "printingMetrics",
    Privacy => "privacy",
    Processes => "processes",
    Proxy => "proxy",
    ReadingList => "readingList",
    Runtime => "runtime",
    Scripting => "scripting",
    Search => "search",
    Sessions => "sessions",
    SidePanel => "sidePanel",
    Storage => "storage",
    SystemCpu => "system.cpu",
    SystemDisplay => "system.display",
    SystemMemory => "system.memory",
    SystemStorage => "system.storage",
    TabCapture => "tabCapture",
    TabGroups => "tabGroups",
    Tabs => "tabs",
    TopSites => "topSites",
    Tts => "tts",
    TtsEngine => "ttsEngine",
    UnlimitedStorage => "unlimitedStorage",
    UserScripts => "userScripts",
    VpnProvider => "vpnProvider",
    Wallpaper => "wallpaper",
    WebAuthenticationProxy => "webAuthenticationProxy",
    WebNavigation => "webNavigation",
    WebRequest => "webRequest",
    WebRequestAuthProvider => "webRequestAuthProvider",
    WebRequestBlocking => "webRequestBlocking",
    WebRequestFilterResponse => "webRequestFilterResponse",
    WebRequestFilterResponseExtraHeaders => "webRequestFilterResponse.extraHeaders",
}

/// Legacy spellings still accepted in manifests
const ALIASES: &[(&str, KnownPermission)] = &[
    ("windows", KnownPermission::Tabs),
    ("unlimited_storage", KnownPermission::UnlimitedStorage),
];

lazy_static::lazy_static! {
    // Dotted names are plain keys here; they are never split on '.'
    static ref PERMISSION_TABLE: HashMap<&'static str, KnownPermission> = {
        let mut table: HashMap<&'static str, KnownPermission> = KnownPermission::ALL
            .iter()
            .map(|permission| (permission.as_str(), *permission))
            .collect();
        for (alias, permission) in ALIASES {
            table.insert(*alias, *permission);
        }
        table
    };
}

/// A parsed manifest permission
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Permission {
    Api(KnownPermission),
    /// Anything not in the table, kept verbatim
    Unknown(String),
}

impl Permission {
    /// Parse a single permission string. Never fails.
    pub fn parse(raw: &str) -> Self {
        match PERMISSION_TABLE.get(raw) {
            Some(permission) => Permission::Api(*permission),
            None => Permission::Unknown(raw.to_string()),
        }
    }

    /// Parse a list, keeping order and duplicates
    pub fn parse_all<S: AsRef<str>>(raw: &[S]) -> Vec<Self> {
        raw.iter().map(|entry| Self::parse(entry.as_ref())).collect()
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Permission::Unknown(_))
    }

    /// Canonical name for known permissions, the original string otherwise
    pub fn raw(&self) -> &str {
        match self {
            Permission::Api(permission) => permission.as_str(),
            Permission::Unknown(raw) => raw,
        }
    }
}

impl From<KnownPermission> for Permission {
    fn from(permission: KnownPermission) -> Self {
        Permission::Api(permission)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.raw())
    }
}

impl fmt::Display for KnownPermission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_known_permission(raw: &str) -> bool {
    !Permission::parse(raw).is_unknown()
}

/// Every string the table accepts, aliases included
pub fn all_known_permissions() -> HashSet<&'static str> {
    PERMISSION_TABLE.keys().copied().collect()
}
