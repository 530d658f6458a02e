use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig},
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Number of classes of the binary segmentation head (background, lane).
pub const NUM_BINARY_CLASSES: usize = 2;

#[derive(Config, Debug)]
pub struct LaneNetConfig {
    /// Dimension of the per-pixel instance embedding.
    #[config(default = 3)]
    pub embedding_dim: usize,
    /// Width of the first encoder stage; each later stage doubles it.
    #[config(default = 16)]
    pub base_channels: usize,
}

impl LaneNetConfig {
    pub fn init<B: Backend>(&self, device: &Device<B>) -> LaneNet<B> {
        let c = self.base_channels;

        LaneNet {
            enc1: DoubleConv::new(3, c, device),
            enc2: DoubleConv::new(c, 2 * c, device),
            enc3: DoubleConv::new(2 * c, 4 * c, device),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            binary_decoder: Decoder::new(c, NUM_BINARY_CLASSES, device),
            instance_decoder: Decoder::new(c, self.embedding_dim, device),
        }
    }
}

/// 3x3 convolution, batch norm, ReLU.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: BatchNorm<B, 2>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Same)
            .init(device);
        let norm = BatchNormConfig::new(out_channels).init(device);

        Self {
            conv,
            norm,
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.norm.forward(x);
        self.activation.forward(x)
    }
}

#[derive(Module, Debug)]
pub struct DoubleConv<B: Backend> {
    first: ConvBlock<B>,
    second: ConvBlock<B>,
}

impl<B: Backend> DoubleConv<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        Self {
            first: ConvBlock::new(in_channels, out_channels, device),
            second: ConvBlock::new(out_channels, out_channels, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        self.second.forward(self.first.forward(x))
    }
}

/// Upsamples the bottleneck back to input resolution, merging the encoder
/// skips, and projects onto `out_channels` with a 1x1 convolution.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    up1: ConvTranspose2d<B>,
    fuse1: DoubleConv<B>,
    up2: ConvTranspose2d<B>,
    fuse2: DoubleConv<B>,
    head: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> Decoder<B> {
    pub fn new(base_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let c = base_channels;
        let up = |from: usize, to: usize| -> ConvTranspose2d<B> {
            ConvTranspose2dConfig::new([from, to], [2, 2])
                .with_stride([2, 2])
                .init(device)
        };

        Self {
            up1: up(4 * c, 2 * c),
            fuse1: DoubleConv::new(4 * c, 2 * c, device),
            up2: up(2 * c, c),
            fuse2: DoubleConv::new(2 * c, c, device),
            head: Conv2dConfig::new([c, out_channels], [1, 1]).init(device),
            activation: Relu::new(),
        }
    }

    pub fn forward(
        &self,
        bottleneck: Tensor<B, 4>,
        skip2: Tensor<B, 4>,
        skip1: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let x = self.activation.forward(self.up1.forward(bottleneck));
        let x = self.fuse1.forward(Tensor::cat(vec![x, skip2], 1));

        let x = self.activation.forward(self.up2.forward(x));
        let x = self.fuse2.forward(Tensor::cat(vec![x, skip1], 1));

        self.head.forward(x)
    }
}

/// Encoder shared by a binary segmentation branch and an instance embedding
/// branch. Input height and width must be divisible by 4.
#[derive(Module, Debug)]
pub struct LaneNet<B: Backend> {
    enc1: DoubleConv<B>,
    enc2: DoubleConv<B>,
    enc3: DoubleConv<B>,
    pool: MaxPool2d,
    binary_decoder: Decoder<B>,
    instance_decoder: Decoder<B>,
}

#[derive(Clone, Debug)]
pub struct LaneNetOutput<B: Backend> {
    /// `[N, 2, H, W]`
    pub binary_logits: Tensor<B, 4>,
    /// `[N, E, H, W]`
    pub instance_embedding: Tensor<B, 4>,
}

impl<B: Backend> LaneNet<B> {
    pub fn forward(&self, images: Tensor<B, 4>) -> LaneNetOutput<B> {
        let skip1 = self.enc1.forward(images);
        let skip2 = self.enc2.forward(self.pool.forward(skip1.clone()));
        let bottleneck = self.enc3.forward(self.pool.forward(skip2.clone()));

        let binary_logits =
            self.binary_decoder
                .forward(bottleneck.clone(), skip2.clone(), skip1.clone());
        let instance_embedding = self.instance_decoder.forward(bottleneck, skip2, skip1);

        LaneNetOutput {
            binary_logits,
            instance_embedding,
        }
    }
}
