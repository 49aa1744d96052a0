//! Halftone orders and transfer maps
//!
//! Only transported: the writer sends them to every band, the reader
//! reassembles them and hands them to the target.

/// One threshold bit of a halftone order
#[derive(Debug,Default,Copy,Clone,PartialEq,Eq)]
pub struct HtBit {
    pub offset: u32,
    pub mask: u32,
}

/// Halftone order of a single component
#[derive(Debug,Default,Clone,PartialEq)]
pub struct HtOrder {
    pub width: u32,
    pub height: u32,
    pub raster: u32,
    pub shift: u32,
    pub num_levels: u32,
    pub num_bits: u32,
    pub levels: Vec<u32>,
    pub bits: Vec<HtBit>,
}

impl HtOrder {
    pub fn new(width: u32, height: u32, raster: u32, shift: u32) -> Self {
        Self { width, height, raster, shift, .. Self::default() }
    }
    pub fn with_levels(mut self, levels: Vec<u32>) -> Self {
        self.num_levels = levels.len() as u32;
        self.levels = levels;
        self
    }
    pub fn with_bits(mut self, bits: Vec<HtBit>) -> Self {
        self.num_bits = bits.len() as u32;
        self.bits = bits;
        self
    }
    /// Every level and bit has arrived
    pub fn is_complete(&self) -> bool {
        self.levels.len() == self.num_levels as usize && self.bits.len() == self.num_bits as usize
    }
}

/// Halftone component with its color name
#[derive(Debug,Clone,PartialEq)]
pub struct HtComponent {
    pub cname: u32,
    pub order: HtOrder,
}

/// Device halftone: a default order plus optional per-component orders
#[derive(Debug,Default,Clone,PartialEq)]
pub struct DeviceHalftone {
    pub ht_type: u8,
    pub order: HtOrder,
    pub components: Vec<HtComponent>,
}

impl DeviceHalftone {
    pub fn new(ht_type: u8, order: HtOrder) -> Self {
        Self { ht_type, order, components: vec![] }
    }
    pub fn with_component(mut self, cname: u32, order: HtOrder) -> Self {
        self.components.push(HtComponent { cname, order });
        self
    }
    /// Order `index`, 0 is the default order, `i` > 0 is `components[i - 1]`
    pub fn order_mut(&mut self, index: usize) -> Option<&mut HtOrder> {
        if index == 0 {
            Some(&mut self.order)
        } else {
            self.components.get_mut(index - 1).map(|c| &mut c.order)
        }
    }
}

/// Entries in a sampled transfer function
pub const TRANSFER_MAP_SIZE: usize = 256;

/// Transfer function, None is the identity
pub type TransferMap = Option<Vec<u16>>;

/// Transfer maps carried by index in the low 5 bits of set_misc map
pub const MAX_TRANSFER_MAPS: usize = 32;
